pub mod admin;
pub mod ca;
pub mod capture;
pub mod config;
pub mod intercept;
pub mod logging;
pub mod proxy;
pub mod recorder;
pub mod relay;
pub mod replay;
pub mod storage;
pub mod tls;
