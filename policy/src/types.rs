//! Static types of the policy language.
//!
//! Typing is deliberately shallow: declared variables get their type from
//! the quantifier declaration, member access is checked against the known
//! fields of the event types, and everything else flows through as unknown.

use std::fmt;

use tracewarden_trace::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Unknown,
    /// Any event kind.
    Event,
    Message,
    ToolCall,
    ToolOutput,
    /// The `function` record of a tool call (`name`, `arguments`).
    Function,
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
}

impl Type {
    /// Resolves a type name as written in a declaration, `(x: Name)`.
    pub fn parse(name: &str) -> Option<Type> {
        match name {
            "Event" => Some(Type::Event),
            "Message" => Some(Type::Message),
            "ToolCall" => Some(Type::ToolCall),
            "ToolOutput" => Some(Type::ToolOutput),
            "str" => Some(Type::Str),
            "int" => Some(Type::Int),
            "float" => Some(Type::Float),
            "bool" => Some(Type::Bool),
            "list" => Some(Type::List),
            "dict" => Some(Type::Dict),
            _ => None,
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Type::Event | Type::Message | Type::ToolCall | Type::ToolOutput
        )
    }

    /// Event kind selected by this type; `None` for `Event` (all kinds).
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            Type::Message => Some(EventKind::Message),
            Type::ToolCall => Some(EventKind::ToolCall),
            Type::ToolOutput => Some(EventKind::ToolOutput),
            _ => None,
        }
    }

    /// Type of `self.member`, or `Err` with an explanation when the member
    /// access is statically wrong.
    pub fn member(&self, name: &str) -> Result<Type, String> {
        match self {
            Type::Unknown | Type::Event => Ok(Type::Unknown),
            Type::Message => match name {
                "role" => Ok(Type::Str),
                "content" => Ok(Type::Unknown),
                "tool_calls" => Ok(Type::List),
                _ => Err(format!("Message has no member '{name}'")),
            },
            Type::ToolCall => match name {
                "id" => Ok(Type::Str),
                "type" => Ok(Type::Str),
                "function" => Ok(Type::Function),
                _ => Err(format!("ToolCall has no member '{name}'")),
            },
            Type::Function => match name {
                "name" => Ok(Type::Str),
                "arguments" => Ok(Type::Dict),
                _ => Err(format!("function has no member '{name}'")),
            },
            Type::ToolOutput => match name {
                "role" => Ok(Type::Str),
                "content" => Ok(Type::Unknown),
                "tool_call_id" => Ok(Type::Str),
                _ => Err(format!("ToolOutput has no member '{name}'")),
            },
            Type::Dict => Err(format!(
                "cannot access member '{name}' on a dict; use indexing instead"
            )),
            other => Err(format!("type {other} has no member '{name}'")),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Unknown => "<unknown>",
            Type::Event => "Event",
            Type::Message => "Message",
            Type::ToolCall => "ToolCall",
            Type::ToolOutput => "ToolOutput",
            Type::Function => "Function",
            Type::Str => "str",
            Type::Int => "int",
            Type::Float => "float",
            Type::Bool => "bool",
            Type::List => "list",
            Type::Dict => "dict",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_lookup() {
        assert_eq!(Type::Message.member("role"), Ok(Type::Str));
        assert_eq!(Type::ToolCall.member("function"), Ok(Type::Function));
        assert_eq!(Type::Function.member("arguments"), Ok(Type::Dict));
        assert!(Type::Message.member("id").is_err());
        assert!(Type::Dict.member("role").is_err());
        assert_eq!(Type::Event.member("anything"), Ok(Type::Unknown));
    }

    #[test]
    fn test_parse() {
        assert_eq!(Type::parse("ToolCall"), Some(Type::ToolCall));
        assert_eq!(Type::parse("dict"), Some(Type::Dict));
        assert_eq!(Type::parse("Widget"), None);
    }
}
