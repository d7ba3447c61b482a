pub mod conv;
pub mod rsu;
pub mod u2net;
pub mod utils;
