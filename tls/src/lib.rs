#[cfg(feature = "openssl")]
pub mod openssl;
#[cfg(any(feature = "rustls", feature = "rustls-ring-crypto"))]
pub mod rustls;
