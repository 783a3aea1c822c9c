pub mod capture;
pub mod status;
pub mod stream;
