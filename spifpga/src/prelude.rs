//! Prelude (helpful reexports) for this package

pub use crate::{
    client::Client,
    config::{
        Config,
        Mode,
        Settings,
    },
    error::{
        Error,
        Result,
    },
    memory::{
        Access,
        AddressSpace,
        UserMemory,
    },
    port::WordPort,
    raw::IocTransfer,
    session::{
        Handle,
        Registry,
        SessionKey,
    },
    transport::{
        mock::Mock,
        Controller,
        Transfer,
    },
};
pub use spiframe::{
    Command,
    Frame,
    FRAME_SIZE,
};
