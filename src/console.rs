//! Line-oriented console commands for the `bench_psu` binary.
//!
//! Each line names one operation. The console remembers the channel of the last
//! completed `select` and uses it wherever a command leaves the channel out, the
//! way a front panel keeps a channel selector.
//!
//! ```text
//! connect                      open the configured transport
//! select 2                     choose channel 2 and select it on the device
//! apply 2 5.0 0.2 protected    voltage, current limit, OVP mode
//! read [2]                     read back setpoints
//! output [2] on|off            switch an output
//! measure [2]                  measure voltage and current
//! reset | save | restore | state
//! write SYST:BEEP              send a raw command
//! query SYST:ERR?              send a raw query
//! devices | status | disconnect | help | quit
//! ```

use crate::error::{PsuError, PsuResult};
use crate::operation::{OperationOutput, OperationReport, OperationRequest};
use crate::transport::TransportSpec;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Run(OperationRequest),
    Devices,
    Status,
    Help,
    Quit,
    Empty,
}

/// Usage text printed by `help`.
pub const HELP: &str = "\
commands:
  connect                      open the configured transport
  select N                     choose channel N
  apply [N] V I measured|protected
  read [N] | measure [N]
  output [N] on|off
  reset | save | restore | state
  write CMD | query CMD?
  devices | status | disconnect | help | quit";

/// Console state: the transport `connect` opens and the chosen channel.
#[derive(Debug, Clone)]
pub struct Console {
    spec: TransportSpec,
    channel: u8,
}

fn usage(message: &str) -> PsuError {
    PsuError::Validation(message.to_string())
}

fn parse_channel(token: &str) -> PsuResult<u8> {
    token
        .parse::<u8>()
        .map_err(|_| PsuError::Validation(format!("channel must be an integer, got '{token}'")))
}

fn parse_switch(token: &str) -> PsuResult<bool> {
    match token.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(PsuError::Validation(format!(
            "output state must be on or off, got '{token}'"
        ))),
    }
}

impl Console {
    pub fn new(spec: TransportSpec, channel: u8) -> Self {
        Self { spec, channel }
    }

    /// Channel used when a command leaves it out.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Adopts the channel of a completed `SelectChannel` as the new default.
    pub fn observe(&mut self, report: &OperationReport) {
        if let Some(OperationOutput::ChannelSelected { channel }) = report.output() {
            self.channel = *channel;
        }
    }

    /// Splits an optional leading channel off `args`.
    fn channel_arg<'a>(&self, args: &'a [&'a str], rest: usize) -> PsuResult<(u8, &'a [&'a str])> {
        if args.len() == rest + 1 {
            Ok((parse_channel(args[0])?, &args[1..]))
        } else if args.len() == rest {
            Ok((self.channel, args))
        } else {
            Err(usage("wrong number of arguments; type 'help'"))
        }
    }

    /// Parses one line.
    ///
    /// # Errors
    ///
    /// `Validation` for unknown commands and bad arguments.
    pub fn parse(&mut self, line: &str) -> PsuResult<ConsoleCommand> {
        let line = line.trim();
        let Some((verb, rest)) = line
            .split_once(char::is_whitespace)
            .map(|(verb, rest)| (verb, rest.trim()))
            .or(Some((line, "")))
            .filter(|(verb, _)| !verb.is_empty())
        else {
            return Ok(ConsoleCommand::Empty);
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let request = match verb.to_ascii_lowercase().as_str() {
            "quit" | "exit" => return Ok(ConsoleCommand::Quit),
            "help" | "?" => return Ok(ConsoleCommand::Help),
            "devices" => return Ok(ConsoleCommand::Devices),
            "status" => return Ok(ConsoleCommand::Status),
            "connect" => OperationRequest::connect(self.spec.clone(), self.channel)?,
            "disconnect" => OperationRequest::disconnect(),
            "select" => {
                let [channel] = args.as_slice() else {
                    return Err(usage("usage: select N"));
                };
                OperationRequest::select_channel(parse_channel(channel)?)?
            }
            "apply" => {
                let (channel, values) = self.channel_arg(&args, 3)?;
                OperationRequest::apply_settings_text(channel, values[0], values[1], values[2])?
            }
            "read" => OperationRequest::read_channel(self.channel_arg(&args, 0)?.0)?,
            "measure" => OperationRequest::measure(self.channel_arg(&args, 0)?.0)?,
            "output" => {
                let (channel, values) = self.channel_arg(&args, 1)?;
                OperationRequest::toggle_output(channel, parse_switch(values[0])?)?
            }
            "reset" => OperationRequest::reset(),
            "save" => OperationRequest::save_unique(),
            "restore" => OperationRequest::restore_unique(),
            "state" => OperationRequest::print_state(),
            "write" => OperationRequest::raw_write(rest)?,
            "query" => OperationRequest::raw_query(rest)?,
            other => {
                return Err(PsuError::Validation(format!(
                    "unknown command '{other}'; type 'help'"
                )))
            }
        };
        Ok(ConsoleCommand::Run(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OvpMode;
    use crate::error::ErrorKind;
    use crate::operation::{OperationKind, Outcome};

    fn console() -> Console {
        Console::new(TransportSpec::Simulated, 1)
    }

    fn request(command: ConsoleCommand) -> OperationRequest {
        match command {
            ConsoleCommand::Run(request) => request,
            other => panic!("expected an operation, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_with_and_without_channel() {
        let mut console = console();
        let explicit = request(console.parse("apply 2 5.0 0.2 protected").unwrap());
        assert_eq!(
            explicit,
            OperationRequest::apply_settings(2, 5.0, 0.2, OvpMode::Protected).unwrap()
        );
        let implicit = request(console.parse("APPLY 12 1 measured").unwrap());
        assert_eq!(implicit.channel(), Some(1));
    }

    fn report(request: &OperationRequest, outcome: Outcome) -> OperationReport {
        let now = chrono::Utc::now();
        OperationReport {
            id: 7,
            operation: request.kind(),
            outcome,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_completed_select_changes_default_channel() {
        let mut console = console();
        let select = request(console.parse("select 3").unwrap());
        assert_eq!(console.channel(), 1);

        console.observe(&report(
            &select,
            Outcome::Completed {
                output: OperationOutput::ChannelSelected { channel: 3 },
            },
        ));
        assert_eq!(console.channel(), 3);
        let read = request(console.parse("read").unwrap());
        assert_eq!(read.channel(), Some(3));
        let connect = request(console.parse("connect").unwrap());
        assert_eq!(connect.channel(), Some(3));
    }

    #[test]
    fn test_failed_select_keeps_channel() {
        let mut console = console();
        assert!(console.parse("select 9").is_err());
        assert_eq!(console.channel(), 1);

        let select = request(console.parse("select 4").unwrap());
        console.observe(&report(
            &select,
            Outcome::Failed {
                step: None,
                error: ErrorKind::Validation,
                message: "channel 4 is not on this instrument".to_string(),
            },
        ));
        assert_eq!(console.channel(), 1);
        assert_eq!(request(console.parse("read").unwrap()).channel(), Some(1));
    }

    #[test]
    fn test_raw_commands_keep_their_text() {
        let mut console = console();
        let query = request(console.parse("query  SYST:ERR? ").unwrap());
        assert_eq!(query.kind(), OperationKind::RawQuery);
        assert_eq!(query, OperationRequest::raw_query("SYST:ERR?").unwrap());
        let err = console.parse("query *IDN").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_misc_lines() {
        let mut console = console();
        assert_eq!(console.parse("   ").unwrap(), ConsoleCommand::Empty);
        assert_eq!(console.parse("quit").unwrap(), ConsoleCommand::Quit);
        assert_eq!(console.parse("devices").unwrap(), ConsoleCommand::Devices);
        assert!(console.parse("output 2 maybe").is_err());
        assert!(console.parse("frobnicate").is_err());
        let toggle = request(console.parse("output 2 on").unwrap());
        assert_eq!(toggle, OperationRequest::toggle_output(2, true).unwrap());
    }
}
