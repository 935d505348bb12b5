pub mod mux;
pub mod relay;
pub mod transport;
