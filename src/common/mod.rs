pub mod addr;
pub mod credential;
pub mod dialer;
pub mod error;
pub mod stream;

pub use addr::{Address, AddressType};
pub use credential::Credentials;
pub use error::{ProxyError, ProxyErrorKind};
pub use stream::ProxyStream;
