//! Core venue types
//!
//! - EndpointType / GrvtEnv / EndpointUrls: websocket channels and their URLs
//! - SessionCredential / CredentialSource: session read at connect time
//! - AuthHeaders: handshake headers derived from the credential

pub mod credential;
pub mod endpoint;

pub use credential::{
    AuthHeaders, CredentialSource, SessionCredential, SharedCredential, ACCOUNT_ID_HEADER,
    COOKIE_HEADER,
};
pub use endpoint::{EndpointError, EndpointType, EndpointUrls, GrvtEnv};
