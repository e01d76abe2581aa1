pub mod headers;
pub mod parser;
pub mod request;
pub mod response;

pub use headers::HeaderMap;
pub use request::{Method, Request};
pub use response::{Response, ResponseBody};
