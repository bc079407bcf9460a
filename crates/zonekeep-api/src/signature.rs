//! Command-line shape of the console server: `<program> vnc -w <bind>:<port> <machine>`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleProcessMatch {
    pub pid: u32,
    pub machine: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ConsoleSignature {
    program: String,
}

impl ConsoleSignature {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn command_tag(&self) -> String {
        format!("{} vnc", self.program_basename())
    }

    pub fn args(&self, bind_address: &str, port: u16, machine: &str) -> Vec<String> {
        vec![
            "vnc".to_string(),
            "-w".to_string(),
            format!("{bind_address}:{port}"),
            machine.to_string(),
        ]
    }

    fn program_basename(&self) -> &str {
        self.program.rsplit('/').next().unwrap_or(&self.program)
    }

    fn is_program(&self, token: &str) -> bool {
        token.rsplit('/').next() == Some(self.program_basename())
    }

    /// Parses a process-table command line; `None` if it is not a console server.
    pub fn parse(&self, pid: u32, command_line: &str) -> Option<ConsoleProcessMatch> {
        let tokens: Vec<&str> = command_line.split_whitespace().collect();
        let start = tokens
            .windows(2)
            .position(|w| self.is_program(w[0]) && w[1] == "vnc")?;
        let rest = &tokens[start + 2..];

        let addr_idx = rest.iter().position(|t| *t == "-w")? + 1;
        let addr = rest.get(addr_idx)?;
        let (_, port) = addr.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;

        let machine = rest.last()?;
        if rest.len() <= addr_idx + 1 || machine.starts_with('-') {
            return None;
        }

        Some(ConsoleProcessMatch {
            pid,
            machine: (*machine).to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> ConsoleSignature {
        ConsoleSignature::new("zadm")
    }

    #[test]
    fn parses_plain_and_absolute_program_paths() {
        let m = sig()
            .parse(4321, "zadm vnc -w 0.0.0.0:8000 web01")
            .unwrap();
        assert_eq!(
            m,
            ConsoleProcessMatch {
                pid: 4321,
                machine: "web01".to_string(),
                port: 8000
            }
        );

        let m = sig()
            .parse(7, "/usr/perl5/bin/perl /usr/sbin/zadm vnc -w 127.0.0.1:8042 db-1")
            .unwrap();
        assert_eq!(m.machine, "db-1");
        assert_eq!(m.port, 8042);
    }

    #[test]
    fn ignores_unrelated_processes() {
        assert!(sig().parse(1, "/usr/lib/ssh/sshd").is_none());
        assert!(sig().parse(1, "zadm list").is_none());
        assert!(sig().parse(1, "vim zadm vnc").is_none());
        assert!(sig().parse(1, "zadm vnc -w 0.0.0.0:8000").is_none());
    }

    #[test]
    fn args_round_trip_through_parse() {
        let s = sig();
        let line = format!("zadm {}", s.args("0.0.0.0", 8010, "web01").join(" "));
        let m = s.parse(99, &line).unwrap();
        assert_eq!((m.machine.as_str(), m.port), ("web01", 8010));
        assert_eq!(s.command_tag(), "zadm vnc");
    }
}
