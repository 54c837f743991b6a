pub mod interface;
pub mod listener;
pub mod prober;
