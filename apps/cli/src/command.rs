use shared::domain::GuildId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Say(String),
    Guilds,
    CreateGuild(String),
    Join(String),
    Room(Option<GuildId>),
    History,
    Online,
    /// Message positions are 1-based, as printed by `/history`.
    Edit { index: usize, content: String },
    Delete(usize),
    Poll { question: String, options: Vec<String> },
    Vote { index: usize, option: usize },
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>                         send a message to the current room
  /guilds                        list your guilds
  /create <name>                 create a guild
  /join <invite code>            join a guild
  /room global | <guild id>      switch rooms
  /history                       show the current room
  /online                        show who is online
  /edit <n> <text>               edit message n
  /delete <n>                    delete message n
  /poll <question> | <a> | <b>   start a poll
  /vote <n> <option>             vote on poll n (options are 1-based)
  /quit";

/// `Ok(None)` for blank lines.
pub fn parse(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Say(line.to_string())));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));

    let input = match name {
        "guilds" => Input::Guilds,
        "create" => Input::CreateGuild(required(rest, "guild name")?),
        "join" => Input::Join(required(rest, "invite code")?),
        "room" => match rest {
            "" | "global" => Input::Room(None),
            raw => Input::Room(Some(GuildId(
                raw.parse().map_err(|_| format!("not a guild id: {raw}"))?,
            ))),
        },
        "history" => Input::History,
        "online" => Input::Online,
        "edit" => {
            let (index, content) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: /edit <n> <text>")?;
            Input::Edit {
                index: position(index)?,
                content: required(content, "new text")?,
            }
        }
        "delete" => Input::Delete(position(rest)?),
        "poll" => {
            let mut parts = rest.split('|').map(str::trim);
            let question = required(parts.next().unwrap_or_default(), "poll question")?;
            let options: Vec<String> = parts
                .filter(|option| !option.is_empty())
                .map(str::to_string)
                .collect();
            if options.len() < 2 {
                return Err("a poll needs at least two options".into());
            }
            Input::Poll { question, options }
        }
        "vote" => {
            let (index, option) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: /vote <n> <option>")?;
            Input::Vote {
                index: position(index)?,
                option: position(option.trim())?,
            }
        }
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(input))
}

fn required(raw: &str, what: &str) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(format!("missing {what}"));
    }
    Ok(raw.to_string())
}

fn position(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("not a position: {raw}")),
    }
}
