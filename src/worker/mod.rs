pub mod client;
pub mod controller;

pub use client::{ForwardedResponse, WorkerClient};
pub use controller::WorkerController;
