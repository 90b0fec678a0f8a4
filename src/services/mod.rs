pub mod broker;
pub mod inference;
pub mod pipeline;
pub mod storage;
pub mod yolo;
