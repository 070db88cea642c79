pub mod decoder;
pub mod feed;
pub mod finality;
pub mod script;
