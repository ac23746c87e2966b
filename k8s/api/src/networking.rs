pub mod gateway;

pub use self::gateway::{
    Gateway, GatewaySpec, Port, PortProtocol, Server, TlsMode, TlsOptions, TlsProtocol,
};
