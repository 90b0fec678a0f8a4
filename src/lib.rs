//! Cell Analysis Worker
//!
//! Consumes analysis jobs from RabbitMQ, downloads the referenced cell image
//! from S3-compatible storage, runs the detection model and records the
//! result and the job's lifecycle in PostgreSQL.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod shutdown;
pub mod worker_state;
