//! Built-in demonstration worker.
//!
//! The host needs at least one loadable realm so a fresh install has
//! somewhere to put players. `EchoFactory` ignores the compiled image
//! and runs a tiny chat room entirely in the host process. It also
//! doubles as the reference implementation of the worker contract.

use std::collections::HashMap;
use std::path::Path;

use realmproto::worker::{
    parse_input_line, Worker, WorkerExit, WorkerFactory, WorkerHost, PROBE_JOIN, PROBE_LOCATE,
    PROBE_PART, PROBE_RTEVENT, PROBE_SHUTDOWN, SILENT_PREFIX,
};

pub struct EchoFactory;

impl WorkerFactory for EchoFactory {
    fn name(&self) -> &str {
        "echo"
    }

    fn load(&self, _image: &Path) -> Result<Box<dyn Worker>, String> {
        Ok(Box::new(EchoWorker {
            names: HashMap::new(),
            ticks: 0,
        }))
    }
}

struct EchoWorker {
    names: HashMap<i32, String>,
    ticks: u64,
}

impl EchoWorker {
    fn name_of(&self, sid: i32) -> &str {
        self.names.get(&sid).map(String::as_str).unwrap_or("Someone")
    }

    fn handle_probe(&mut self, line: &str, host: &mut dyn WorkerHost) -> Option<WorkerExit> {
        if line == PROBE_SHUTDOWN {
            return Some(WorkerExit::Halted);
        }
        if let Some(rest) = line.strip_prefix(PROBE_JOIN) {
            let mut parts = rest.split_whitespace();
            if let (Some(sid), Some(name)) = (parts.next(), parts.next()) {
                if let Ok(sid) = sid.parse::<i32>() {
                    self.names.insert(sid, name.to_string());
                    host.write(
                        format!("<$a>{name} arrives in the echo chamber.\n</$a>").as_bytes(),
                    );
                    host.write(
                        format!(
                            "<$t {sid}>Welcome, {name}. Anything you say comes right back.\n</$t>"
                        )
                        .as_bytes(),
                    );
                }
            }
        } else if let Some(rest) = line.strip_prefix(PROBE_PART) {
            if let Ok(sid) = rest.trim().parse::<i32>() {
                if let Some(name) = self.names.remove(&sid) {
                    host.write(format!("<$a>{name} fades away.\n</$a>").as_bytes());
                }
            }
        } else if line.starts_with(PROBE_LOCATE) {
            // Single room; everyone is at the center.
            host.write(b"center\n");
        } else if line == PROBE_RTEVENT {
            self.ticks += 1;
            host.write(format!("<$a>The chamber hums ({}).\n</$a>", self.ticks).as_bytes());
        }
        None
    }

    fn handle_player(&mut self, sid: i32, cmd: &str, host: &mut dyn WorkerHost) {
        let cmd = cmd.trim();
        if let Some(msg) = cmd.strip_prefix("$say ") {
            let name = self.name_of(sid).to_string();
            host.write(format!("<$a>{name} says, \"{msg}\"\n</$a>").as_bytes());
        } else if let Some(act) = cmd.strip_prefix("$pose ") {
            let name = self.name_of(sid).to_string();
            host.write(format!("<$a>{name} {act}\n</$a>").as_bytes());
        } else if cmd == "time" {
            let tod = host.get_word("timeofday", sid);
            host.write(
                format!("<$t {sid}>{:02}:{:02} here too.\n</$t>", tod / 3600, tod % 3600 / 60)
                    .as_bytes(),
            );
        } else if cmd == "who" {
            let mut names: Vec<&str> = self.names.values().map(String::as_str).collect();
            names.sort_unstable();
            host.write(format!("<$t {sid}>Present: {}.\n</$t>", names.join(", ")).as_bytes());
        } else if !cmd.is_empty() {
            host.write(format!("<$t {sid}>Echo: {cmd}\n</$t>").as_bytes());
        }
    }
}

impl Worker for EchoWorker {
    fn run(&mut self, host: &mut dyn WorkerHost) -> WorkerExit {
        loop {
            let Some(line) = host.read_line() else {
                return WorkerExit::Stopped;
            };
            let line = line.strip_prefix(SILENT_PREFIX).unwrap_or(&line);
            if line.starts_with('$') && !line.contains(':') {
                if let Some(exit) = self.handle_probe(line, host) {
                    return exit;
                }
                continue;
            }
            match parse_input_line(line) {
                Ok((sid, cmd)) => {
                    let cmd = cmd.to_string();
                    self.handle_player(sid, &cmd, host);
                }
                Err(_) => {
                    if let Some(exit) = self.handle_probe(line, host) {
                        return exit;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Canned-input harness for driving a worker without an instance.
    struct TestHost {
        input: Vec<String>,
        pub out: Vec<u8>,
    }

    impl TestHost {
        fn new(lines: &[&str]) -> Self {
            let mut input: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
            input.reverse();
            Self {
                input,
                out: Vec::new(),
            }
        }

        fn output(&self) -> String {
            String::from_utf8_lossy(&self.out).into_owned()
        }
    }

    impl WorkerHost for TestHost {
        fn write(&mut self, chunk: &[u8]) {
            self.out.extend_from_slice(chunk);
        }

        fn read_line(&mut self) -> Option<String> {
            self.input.pop()
        }

        fn get_word(&mut self, _register: &str, _arg: i32) -> i32 {
            3661 // 01:01:01
        }

        fn put_word(&mut self, _register: &str, _arg: i32, _value: i32) -> bool {
            false
        }

        fn get_text(&mut self, _register: &str, _arg: &str) -> Option<String> {
            None
        }

        fn put_text(&mut self, _register: &str, _key: &str, _value: &str) -> bool {
            false
        }
    }

    #[test]
    fn says_are_broadcast_with_the_speaker_name() {
        let mut host = TestHost::new(&["$join 1 Ada", "1:$say hi all"]);
        let mut w = EchoWorker {
            names: HashMap::new(),
            ticks: 0,
        };
        assert_eq!(w.run(&mut host), WorkerExit::Stopped);
        assert!(host.output().contains("<$a>Ada says, \"hi all\"\n</$a>"));
    }

    #[test]
    fn plain_input_is_echoed_back_to_the_sender_only() {
        let mut host = TestHost::new(&["$join 2 Bob", "2:hello there"]);
        let mut w = EchoWorker {
            names: HashMap::new(),
            ticks: 0,
        };
        w.run(&mut host);
        assert!(host.output().contains("<$t 2>Echo: hello there\n</$t>"));
    }

    #[test]
    fn locate_answers_untagged_and_shutdown_halts() {
        let mut host = TestHost::new(&["$locate 1", "$shutdown", "1:never seen"]);
        let mut w = EchoWorker {
            names: HashMap::new(),
            ticks: 0,
        };
        assert_eq!(w.run(&mut host), WorkerExit::Halted);
        assert!(host.output().starts_with("center\n"));
        assert!(!host.output().contains("never seen"));
    }

    #[test]
    fn time_command_reads_the_clock_register() {
        let mut host = TestHost::new(&["$join 1 Ada", "1:time"]);
        let mut w = EchoWorker {
            names: HashMap::new(),
            ticks: 0,
        };
        w.run(&mut host);
        assert!(host.output().contains("<$t 1>01:01 here too.\n</$t>"));
    }
}
