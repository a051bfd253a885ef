pub mod credential;
pub mod item;
pub mod outcome;
