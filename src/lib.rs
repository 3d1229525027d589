pub mod cache;
pub mod coverage;
pub mod error;
pub mod geo;
pub mod io;
pub mod physics;
pub mod terrain;
