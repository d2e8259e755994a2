pub mod handler;
pub mod model_router;
pub mod stream;
pub mod stream_bridge;
pub mod transform;
pub mod upstream;
