//! SCP transfer classification
//!
//! SCP runs as `exec` of `scp -t <target>` (sink, the client uploads) or
//! `scp -f <source>` (source, the client downloads). For uploads the remote
//! name only shows up in the first control line the client sends:
//! `C<mode> <size> <name>\n`.

use crate::error::{Error, Result};
use crate::protocol::FileEvent;

/// Whether an exec command line is the remote end of an SCP transfer
pub fn is_transfer(command: &str) -> bool {
    let mut tokens = command.split(' ');
    let program = tokens.next().unwrap_or_default();
    let is_scp = program == "scp" || program.ends_with("/scp");
    is_scp && matches!(tokens.next(), Some("-t") | Some("-f"))
}

/// Classify an SCP exec from its command line and the first data chunk the
/// client sent on the channel
pub fn classify(command: &str, first_chunk: &[u8]) -> Result<FileEvent> {
    let tokens: Vec<&str> = command.split(' ').collect();

    if tokens.get(1) == Some(&"-t") {
        let header = String::from_utf8_lossy(first_chunk);
        let line = header.split('\n').next().unwrap_or_default();
        let filename = line
            .split(' ')
            .nth(2)
            .map(|name| name.trim_end_matches('\r'))
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Inspect(format!("No filename in SCP header {:?}", line)))?;
        Ok(FileEvent::upload(filename))
    } else {
        let filename = tokens
            .get(2)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Inspect(format!("No filename in command {:?}", command)))?;
        Ok(FileEvent::download(*filename))
    }
}
