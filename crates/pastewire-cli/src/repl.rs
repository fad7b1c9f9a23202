//! Parsing of stdin lines.

pub const HELP: &str = "\
Paste an offer to answer it, or type /offer to create one.
Once connected, every line is sent as a chat message.

  /offer    create a new offer
  /wait     wait for a remote offer
  /state    show the connection state
  /destroy  close the current connection
  /help     show this help
  /quit     exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Offer,
    Wait,
    State,
    Destroy,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Command(Command),
    Unknown(&'a str),
    /// Anything else: a descriptor or a chat message.
    Text(&'a str),
}

pub fn parse(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(name) = trimmed.strip_prefix('/') else {
        return Input::Text(line);
    };
    match name {
        "offer" => Input::Command(Command::Offer),
        "wait" => Input::Command(Command::Wait),
        "state" => Input::Command(Command::State),
        "destroy" => Input::Command(Command::Destroy),
        "help" | "?" => Input::Command(Command::Help),
        "quit" | "exit" => Input::Command(Command::Quit),
        _ => Input::Unknown(trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands() {
        assert_eq!(parse("/offer"), Input::Command(Command::Offer));
        assert_eq!(parse("  /quit \n"), Input::Command(Command::Quit));
        assert_eq!(parse("/exit"), Input::Command(Command::Quit));
        assert_eq!(parse("/nope"), Input::Unknown("/nope"));
    }

    #[test]
    fn text_is_passed_verbatim() {
        let offer = r#"{"type":"offer","sdp":"v=0"}"#;
        assert_eq!(parse(offer), Input::Text(offer));
        assert_eq!(parse(" hello "), Input::Text(" hello "));
        assert_eq!(parse("   "), Input::Empty);
    }
}
