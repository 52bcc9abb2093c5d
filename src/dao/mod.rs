/// Remote authority of record for sessions.
pub mod authority;
/// Broadcast channel transports.
pub mod channel;
/// HTTP implementation of the authority.
pub mod http;
