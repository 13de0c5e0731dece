pub mod connections;
mod handler;
mod protocol;

pub use handler::{
    router, GatewayIdentity, ACCOUNT_ID_HEADER, DISPLAY_NAME_HEADER, WORKSPACE_ID_HEADER,
};
