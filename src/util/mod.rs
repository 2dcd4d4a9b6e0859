pub mod bounded_queue;
pub mod buf_ext;
