//! The interactive gate in front of a full drop.
//!
//! A [`DropConfirmation`] can only be obtained from [`confirm_full_drop`],
//! which returns one only after the operator typed the exact phrase. The sync
//! engine's `drop_all` takes the token by value, so there is no code path to a
//! full drop that skips the prompt.

use crate::config::DROP_CONFIRMATION_PHRASE;
use crate::error::SyncError;
use std::io::{BufRead, Write};
use tracing::{info, warn};

/// Proof that the operator confirmed dropping everything in one store.
#[derive(Debug)]
pub struct DropConfirmation {
    target: String,
}

impl DropConfirmation {
    /// The store description the confirmation was given for.
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Prints the warning and the required phrase, then reads one line.
///
/// Only the line terminator is stripped before comparing, so case, spacing and
/// empty input all decline. Read or write failures decline too.
pub fn confirm_full_drop<R: BufRead, W: Write>(
    target: &str,
    input: &mut R,
    out: &mut W,
) -> Result<DropConfirmation, SyncError> {
    let prompt = write!(
        out,
        "\nWARNING: this deletes EVERY node, relationship, index and constraint in\n\
         \x20   {target}\n\
         including data that was not loaded by this tool. It cannot be undone.\n\n\
         Type {DROP_CONFIRMATION_PHRASE} to continue: "
    )
    .and_then(|_| out.flush());
    if let Err(e) = prompt {
        warn!(error = %e, "Could not show drop confirmation prompt");
        return Err(SyncError::Declined);
    }

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => return Err(SyncError::Declined),
        Ok(_) => {}
    }

    let answer = line
        .strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(&line);

    if answer == DROP_CONFIRMATION_PHRASE {
        info!(target_store = target, "Full drop confirmed");
        Ok(DropConfirmation {
            target: target.to_string(),
        })
    } else {
        info!(target_store = target, "Full drop declined");
        Err(SyncError::Declined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn answer(text: &str) -> (Result<DropConfirmation, SyncError>, String) {
        let mut input = Cursor::new(text.as_bytes().to_vec());
        let mut out = Vec::new();
        let result = confirm_full_drop("bolt://db:7687", &mut input, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn exact_phrase_confirms() {
        let (result, _) = answer("DELETE ALL DATA\n");
        assert_eq!(result.unwrap().target(), "bolt://db:7687");
        let (result, _) = answer("DELETE ALL DATA\r\n");
        assert!(result.is_ok());
        let (result, _) = answer("DELETE ALL DATA");
        assert!(result.is_ok());
    }

    #[test]
    fn anything_else_declines() {
        for text in ["delete all data\n", "\n", "", " DELETE ALL DATA\n", "DELETE ALL DATA \n", "yes\n"] {
            let (result, _) = answer(text);
            assert!(
                matches!(result, Err(SyncError::Declined)),
                "{text:?} should decline"
            );
        }
    }

    #[test]
    fn prompt_shows_warning_and_phrase_before_reading() {
        let (_, printed) = answer("\n");
        assert!(printed.contains("WARNING"));
        assert!(printed.contains("bolt://db:7687"));
        assert!(printed.contains("DELETE ALL DATA"));
    }
}
