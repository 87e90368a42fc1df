//! Trait abstraction for the modem line channel to enable testing

use async_trait::async_trait;

use crate::error::ModemError;
use crate::modem::ModemCommand;

/// Line-oriented request/response channel to the radio modem.
#[async_trait]
pub trait ModemLink: Send {
    /// Send `command` and wait (bounded) for its acknowledgement.
    ///
    /// Lines that arrive while waiting and are not a response to the
    /// command are kept for [`ModemLink::take_pending_lines`].
    async fn execute(&mut self, command: &ModemCommand) -> Result<(), ModemError>;

    /// Take every non-response line received so far, oldest first.
    ///
    /// Never waits; returns an empty list when nothing is buffered.
    fn take_pending_lines(&mut self) -> Vec<String>;
}
