pub mod compare;
pub mod harness;
pub mod identity;
pub mod invoke;
pub mod precompiles;
pub mod rpc;
pub mod utils;
