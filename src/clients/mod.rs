//! Outbound clients guarded by retry policies and circuit breakers

pub mod http;
pub mod platform;

pub use http::{GuardedHttpClient, HttpConfig, HttpResponse, Validators};
pub use platform::{
    ChatPlatform, DiscordRest, GuardedPlatformClient, PlatformConfig, classify_platform_error,
};
