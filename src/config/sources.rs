pub mod global_file;
