pub mod create;
pub mod delete;
pub mod output;
pub mod ping;
pub mod update;
pub mod wait;

pub mod util;
