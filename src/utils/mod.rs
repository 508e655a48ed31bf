pub mod http;
pub mod logging;
pub mod telegram;
pub mod text;
pub mod timing;
