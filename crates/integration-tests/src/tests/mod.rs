mod archive;
mod tree;
