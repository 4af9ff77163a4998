//! Protocol-v2 command parsing (spec.md §3, §4.4).
//!
//! Builds on [`crate::pktline`] framing to recognise the two in-band commands
//! this proxy understands, `ls-refs` and `fetch`, while keeping the exact
//! original bytes around so they can be forwarded upstream byte-for-byte
//! (spec.md §4.4.1: "forwarded to upstream byte-exact so that capabilities the
//! proxy does not understand still round-trip").

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::pktline::{self, PktLine};

/// One parsed protocol-v2 command: a header, capability lines, and arguments,
/// plus the untouched bytes the client sent for it.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub capabilities: Vec<String>,
    pub args: Vec<String>,
    pub raw: Bytes,
}

impl Command {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name || c.starts_with(&format!("{name}=")))
    }

    pub fn args_named(&self, keyword: &str) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|a| a.strip_prefix(keyword).map(str::trim))
            .collect()
    }

    pub fn has_arg(&self, literal: &str) -> bool {
        self.args.iter().any(|a| a == literal)
    }
}

/// Splits a request body into a sequence of commands, each terminated by its
/// own flush packet (spec.md §4.1 step 5).
pub fn parse_commands(mut body: Bytes) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    while !body.is_empty() {
        let start = body.clone();
        let lines = pktline::decode_until_flush(&mut body)?;
        let consumed = start.len() - body.len();
        let raw = start.slice(0..consumed);
        commands.push(parse_one(lines, raw)?);
    }
    Ok(commands)
}

fn parse_one(lines: Vec<PktLine>, raw: Bytes) -> Result<Command> {
    let mut iter = lines.into_iter();
    let header = iter
        .next()
        .and_then(|l| l.as_data().map(|d| String::from_utf8_lossy(d).into_owned()))
        .ok_or_else(|| Error::invalid_argument("command is missing its header line"))?;
    let name = header
        .trim_end_matches('\n')
        .strip_prefix("command=")
        .ok_or_else(|| Error::invalid_argument("command header missing 'command=' prefix"))?
        .to_string();

    let mut capabilities = Vec::new();
    let mut saw_delim = false;
    let mut args = Vec::new();

    for line in iter {
        match line {
            PktLine::Delim => saw_delim = true,
            PktLine::Flush => break,
            PktLine::ResponseEnd => {
                return Err(Error::invalid_argument(
                    "unexpected response-end packet in a request command",
                ))
            }
            PktLine::Data(payload) => {
                let text = String::from_utf8_lossy(&payload).trim_end_matches('\n').to_string();
                if saw_delim {
                    args.push(text);
                } else {
                    capabilities.push(text);
                }
            }
        }
    }

    Ok(Command {
        name,
        capabilities,
        args,
        raw,
    })
}

/// Arguments recognised for `ls-refs` (spec.md §4.4.1).
#[derive(Debug, Default, Clone)]
pub struct LsRefsArgs {
    pub ref_prefixes: Vec<String>,
    pub symrefs: bool,
}

impl LsRefsArgs {
    pub fn from_command(cmd: &Command) -> Self {
        let ref_prefixes = cmd
            .args_named("ref-prefix ")
            .into_iter()
            .map(str::to_string)
            .collect();
        let symrefs = cmd.has_arg("symrefs");
        Self {
            ref_prefixes,
            symrefs,
        }
    }

    pub fn matches(&self, ref_name: &str) -> bool {
        self.ref_prefixes.is_empty() || self.ref_prefixes.iter().any(|p| ref_name.starts_with(p))
    }
}

/// Arguments recognised for `fetch` (spec.md §4.4.2).
#[derive(Debug, Default, Clone)]
pub struct FetchArgs {
    pub wants: Vec<String>,
    pub want_refs: Vec<String>,
    pub haves: Vec<String>,
    pub done: bool,
    pub no_progress: bool,
    pub filter: Option<String>,
}

impl FetchArgs {
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            wants: cmd.args_named("want ").into_iter().map(str::to_string).collect(),
            want_refs: cmd
                .args_named("want-ref ")
                .into_iter()
                .map(str::to_string)
                .collect(),
            haves: cmd.args_named("have ").into_iter().map(str::to_string).collect(),
            done: cmd.has_arg("done"),
            no_progress: cmd.has_arg("no-progress"),
            filter: cmd.args_named("filter ").into_iter().next().map(str::to_string),
        }
    }
}

/// Builds the bytes of a synthetic `ls-refs` command restricted to the given
/// ref names — used by the `fetch` cache-decision engine to cheaply learn
/// upstream's current tip for every `want-ref` the client named (spec.md
/// §4.4.2 step 1), without forwarding the client's full (and possibly huge)
/// `fetch` command upstream just to resolve a handful of ref names.
pub fn build_ls_refs_for_refs(ref_names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(pktline::encode_data(b"command=ls-refs\n"));
    out.extend(pktline::encode_data(b"agent=goblet\n"));
    out.extend(pktline::encode_delim());
    for name in ref_names {
        out.extend(pktline::encode_data(format!("ref-prefix {name}\n").as_bytes()));
    }
    out.extend(pktline::encode_flush());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_command(header: &str, caps: &[&str], args: &[&str]) -> Bytes {
        let mut out = Vec::new();
        out.extend(pktline::encode_data(header.as_bytes()));
        for cap in caps {
            out.extend(pktline::encode_data(format!("{cap}\n").as_bytes()));
        }
        out.extend(pktline::encode_delim());
        for arg in args {
            out.extend(pktline::encode_data(format!("{arg}\n").as_bytes()));
        }
        out.extend(pktline::encode_flush());
        Bytes::from(out)
    }

    #[test]
    fn parses_ls_refs_with_prefixes_and_symrefs() {
        let body = encode_command(
            "command=ls-refs\n",
            &["agent=git/2.40.0"],
            &["ref-prefix refs/heads/", "ref-prefix refs/tags/", "symrefs"],
        );
        let commands = parse_commands(body.clone()).unwrap();
        assert_eq!(commands.len(), 1);
        let cmd = &commands[0];
        assert_eq!(cmd.name, "ls-refs");
        assert_eq!(cmd.raw, body);

        let args = LsRefsArgs::from_command(cmd);
        assert_eq!(args.ref_prefixes, vec!["refs/heads/", "refs/tags/"]);
        assert!(args.symrefs);
        assert!(args.matches("refs/heads/main"));
        assert!(!args.matches("refs/notes/commits"));
    }

    #[test]
    fn empty_prefix_list_matches_everything() {
        let body = encode_command("command=ls-refs\n", &[], &[]);
        let cmd = &parse_commands(body).unwrap()[0];
        let args = LsRefsArgs::from_command(cmd);
        assert!(args.matches("refs/heads/anything"));
    }

    #[test]
    fn parses_fetch_wants_and_haves() {
        let body = encode_command(
            "command=fetch\n",
            &[],
            &[
                "want 1111111111111111111111111111111111111111",
                "want-ref refs/heads/main",
                "have 2222222222222222222222222222222222222222",
                "done",
            ],
        );
        let cmd = &parse_commands(body).unwrap()[0];
        let args = FetchArgs::from_command(cmd);
        assert_eq!(args.wants, vec!["1111111111111111111111111111111111111111"]);
        assert_eq!(args.want_refs, vec!["refs/heads/main"]);
        assert_eq!(args.haves, vec!["2222222222222222222222222222222222222222"]);
        assert!(args.done);
    }

    #[test]
    fn multiple_commands_in_one_body_are_split_on_flush() {
        let mut body = Vec::new();
        body.extend(encode_command("command=ls-refs\n", &[], &["symrefs"]));
        body.extend(encode_command("command=fetch\n", &[], &["done"]));
        let commands = parse_commands(Bytes::from(body)).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name, "ls-refs");
        assert_eq!(commands[1].name, "fetch");
    }

    #[test]
    fn missing_command_header_is_rejected() {
        let mut out = Vec::new();
        out.extend(pktline::encode_delim());
        out.extend(pktline::encode_flush());
        assert!(parse_commands(Bytes::from(out)).is_err());
    }
}
