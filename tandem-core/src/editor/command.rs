//! Discrete editing commands.

use serde_json::Value;

use crate::model::{HeadingLevel, MarkKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorCommand {
    InsertText(String),
    DeleteBackward,
    SplitBlock,
    ToggleBold,
    ToggleItalic,
    ToggleUnderline,
    ToggleHighlight,
    SetColor(String),
    UnsetColor,
    ToggleHeading(HeadingLevel),
    SetParagraph,
    ToggleBulletList,
    ToggleOrderedList,
    InsertImage { src: String },
    InsertTable { rows: u32, cols: u32, header_row: bool },
    Undo,
    Redo,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("command '{command}' needs argument '{arg}'")]
    MissingArgument { command: String, arg: &'static str },
    #[error("command '{command}' got an invalid '{arg}'")]
    InvalidArgument { command: String, arg: &'static str },
}

impl EditorCommand {
    /// Parses a toolbar command name with its JSON arguments.
    ///
    /// Names follow the browser editor: `toggleHeading` takes `{"level": n}`,
    /// `setColor` takes a color string or `{"color": ".."}`, `setImage` takes
    /// `{"src": ".."}` and `insertTable` takes `{"rows", "cols", "withHeaderRow"}`.
    pub fn from_name(name: &str, args: &Value) -> Result<Self, CommandError> {
        let args = Args { name, args };
        let command = match name {
            "insertText" | "insertContent" => {
                EditorCommand::InsertText(args.string_or_field("text")?)
            }
            "deleteBackward" | "joinBackward" => EditorCommand::DeleteBackward,
            "splitBlock" => EditorCommand::SplitBlock,
            "toggleBold" => EditorCommand::ToggleBold,
            "toggleItalic" => EditorCommand::ToggleItalic,
            "toggleUnderline" => EditorCommand::ToggleUnderline,
            "toggleHighlight" => EditorCommand::ToggleHighlight,
            "setColor" => EditorCommand::SetColor(args.string_or_field("color")?),
            "unsetColor" => EditorCommand::UnsetColor,
            "toggleHeading" => {
                let level = args.number("level")?;
                let level = u8::try_from(level)
                    .ok()
                    .and_then(HeadingLevel::new)
                    .ok_or_else(|| args.invalid("level"))?;
                EditorCommand::ToggleHeading(level)
            }
            "setParagraph" => EditorCommand::SetParagraph,
            "toggleBulletList" => EditorCommand::ToggleBulletList,
            "toggleOrderedList" => EditorCommand::ToggleOrderedList,
            "setImage" => EditorCommand::InsertImage {
                src: args.string_or_field("src")?,
            },
            "insertTable" => EditorCommand::InsertTable {
                rows: args.optional_number("rows", 3)?,
                cols: args.optional_number("cols", 3)?,
                header_row: args
                    .args
                    .get("withHeaderRow")
                    .map(|value| value.as_bool().ok_or_else(|| args.invalid("withHeaderRow")))
                    .transpose()?
                    .unwrap_or(true),
            },
            "undo" => EditorCommand::Undo,
            "redo" => EditorCommand::Redo,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }

    /// Mark toggled by this command, if it is a mark toggle.
    pub fn toggled_mark(&self) -> Option<MarkKind> {
        match self {
            EditorCommand::ToggleBold => Some(MarkKind::Bold),
            EditorCommand::ToggleItalic => Some(MarkKind::Italic),
            EditorCommand::ToggleUnderline => Some(MarkKind::Underline),
            EditorCommand::ToggleHighlight => Some(MarkKind::Highlight),
            _ => None,
        }
    }
}

struct Args<'a> {
    name: &'a str,
    args: &'a Value,
}

impl Args<'_> {
    fn missing(&self, arg: &'static str) -> CommandError {
        CommandError::MissingArgument {
            command: self.name.to_string(),
            arg,
        }
    }

    fn invalid(&self, arg: &'static str) -> CommandError {
        CommandError::InvalidArgument {
            command: self.name.to_string(),
            arg,
        }
    }

    fn string_or_field(&self, field: &'static str) -> Result<String, CommandError> {
        let value = match self.args {
            Value::String(_) => self.args,
            other => other.get(field).ok_or_else(|| self.missing(field))?,
        };
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(field))
    }

    fn number(&self, field: &'static str) -> Result<u64, CommandError> {
        self.args
            .get(field)
            .ok_or_else(|| self.missing(field))?
            .as_u64()
            .ok_or_else(|| self.invalid(field))
    }

    fn optional_number(&self, field: &'static str, default: u32) -> Result<u32, CommandError> {
        match self.args.get(field) {
            None => Ok(default),
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| self.invalid(field)),
        }
    }
}
