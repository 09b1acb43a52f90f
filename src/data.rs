pub mod domain;
pub mod grid;
pub mod observation;
pub mod window;
