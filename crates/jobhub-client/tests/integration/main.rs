// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod request_layer;
pub mod transport;
pub mod utils;

pub use utils::*;
