pub mod audit;
pub mod choreography;
pub mod operations;
pub mod sales;
