use std::fs;
use std::io::{self, Read};
use std::path::Path;

use anyhow::Context;
use caseflow_core::ResponseDecoder;

use super::{CommandResult, EXIT_DECODE, EXIT_OK};

const COMMAND: &str = "decode";

/// Reads the model output from `file`, or stdin when no file is given.
pub fn run(file: Option<&Path>) -> CommandResult {
    let raw = match read_input(file) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure(COMMAND, "input", format!("{error:#}"), EXIT_DECODE)
        }
    };
    run_raw(&raw)
}

pub fn run_raw(raw: &str) -> CommandResult {
    match ResponseDecoder::default().decode(raw) {
        Ok(record) => CommandResult::document(COMMAND, &record, EXIT_OK),
        Err(failure) => CommandResult::document(COMMAND, &failure, EXIT_DECODE),
    }
}

fn read_input(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("could not read model output from `{}`", path.display())),
        None => {
            let mut raw = String::new();
            io::stdin()
                .read_to_string(&mut raw)
                .context("could not read model output from stdin")?;
            Ok(raw)
        }
    }
}
