pub mod fs_atomic;
pub mod local_socket;
pub mod relay;
pub mod user_paths;
