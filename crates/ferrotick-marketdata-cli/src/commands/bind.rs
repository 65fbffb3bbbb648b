use std::fs;

use ferrotick_marketdata::{InputSlotBinder, ProcessorDeclaration};

use crate::cli::BindArgs;
use crate::error::CliError;

use super::CommandReport;

pub fn run(args: &BindArgs) -> Result<CommandReport, CliError> {
    let text = fs::read_to_string(&args.declaration)?;
    let declaration: ProcessorDeclaration = serde_json::from_str(&text)?;

    let bound = InputSlotBinder::default().bind(&declaration)?;
    Ok(CommandReport::complete(serde_json::to_value(&bound)?))
}
