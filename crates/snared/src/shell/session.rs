//! Emulated command prompt session.
//!
//! One `ShellSession` per accepted connection. `execute` is synchronous and does
//! no I/O: it maps a raw command line to the text the transport should send and
//! updates the session's working directory. Nothing here can fail; unknown
//! input becomes an in-character error message.

use rand::Rng;

use super::canned;
use super::vfs::{self, VirtualFilesystem};

/// Lines printed by `cls`
const CLS_LINES: usize = 50;

/// Free space shown at the bottom of `dir`
const BYTES_FREE: &str = "14,348,484,608";

/// Static facts about the emulated host, shared by all its sessions
#[derive(Debug, Clone)]
pub struct HostProfile {
    pub hostname: String,
    pub domain: String,
    pub identities: Vec<String>,
}

/// Result of one command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Text to send back, possibly empty
    Output(String),
    /// `exit` / `logout`: close the session without another prompt
    Exit,
}

impl CommandOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            CommandOutcome::Output(text) => Some(text),
            CommandOutcome::Exit => None,
        }
    }
}

pub struct ShellSession {
    identity: String,
    working_dir: String,
    fs: VirtualFilesystem,
    profile: HostProfile,
    volume_serial: (u16, u16),
}

impl ShellSession {
    pub fn new(identity: &str, profile: HostProfile) -> Self {
        let mut identities = profile.identities.clone();
        if !identities.iter().any(|i| i.eq_ignore_ascii_case(identity)) {
            identities.push(identity.to_string());
        }
        let fs = VirtualFilesystem::for_identities(&identities);

        let home = vfs::home_dir(identity);
        let working_dir = fs.canonical(&home).map(str::to_string).unwrap_or(home);

        let mut rng = rand::thread_rng();
        Self {
            identity: identity.to_string(),
            working_dir,
            fs,
            profile,
            volume_serial: (rng.gen(), rng.gen()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn home(&self) -> String {
        let home = vfs::home_dir(&self.identity);
        self.fs.canonical(&home).map(str::to_string).unwrap_or(home)
    }

    pub fn prompt(&self) -> String {
        format!("{}> ", self.working_dir)
    }

    /// Run one command line
    pub fn execute(&mut self, line: &str) -> CommandOutcome {
        let command = line.trim();
        if command.is_empty() {
            return CommandOutcome::Output(String::new());
        }

        let (verb, rest) = split_verb(command);
        let verb_lower = verb.to_ascii_lowercase();

        let output = match verb_lower.as_str() {
            "exit" | "logout" => return CommandOutcome::Exit,
            "cd" | "chdir" => self.change_directory(rest),
            "dir" => self.dir_listing(),
            "cls" => "\n".repeat(CLS_LINES),
            "whoami" => format!("{}\\{}", self.profile.domain, self.identity),
            "hostname" => self.profile.hostname.clone(),
            "net" => self.net(command, rest),
            "type" => type_file(rest),
            "ipconfig" => canned::ipconfig(),
            "systeminfo" => canned::systeminfo(&self.profile.hostname),
            "ver" => canned::ver(),
            v if v.starts_with("powershell") => canned::powershell(&self.working_dir),
            // `cd..` and `cd\` are legal without a space
            v if v.starts_with("cd.") || v.starts_with("cd\\") => {
                self.change_directory(command[2..].trim())
            }
            _ => not_recognized(command),
        };

        CommandOutcome::Output(output)
    }

    fn net(&self, command: &str, rest: &str) -> String {
        let (sub, name) = split_verb(rest);
        if !sub.eq_ignore_ascii_case("user") {
            return not_recognized(command);
        }

        let name = name.trim();
        if name.is_empty() {
            return canned::user_list(&self.profile.hostname, &self.profile.identities);
        }

        match self
            .profile
            .identities
            .iter()
            .find(|i| i.eq_ignore_ascii_case(name))
        {
            Some(user) => canned::user_details(user),
            None => format!("The user name could not be found: {}", name),
        }
    }

    fn within_home(&self, home: &str) -> bool {
        let dir = self.working_dir.to_ascii_lowercase();
        let home = home.to_ascii_lowercase();
        dir == home || dir.starts_with(&format!("{}\\", home))
    }

    fn change_directory(&mut self, arg: &str) -> String {
        let home = self.home();
        if !self.within_home(&home) {
            self.working_dir = home.clone();
        }

        let arg = arg.trim().trim_matches('"');
        if arg.is_empty() || arg == "." {
            return String::new();
        }
        // The drive root is out of reach; home stands in for it
        if arg == "\\" || arg == "/" {
            self.working_dir = home;
            return String::new();
        }

        let relative = if arg.starts_with('\\') || arg.contains(':') {
            // Absolute paths only resolve inside the home tree
            match strip_prefix_ignore_case(arg, &home) {
                Some(rest) => {
                    return self.walk(home.clone(), rest, arg);
                }
                None => return path_not_found(arg),
            }
        } else {
            arg
        };

        self.walk(self.working_dir.clone(), relative, arg)
    }

    /// Resolve `path` from `start`; commit only if every segment resolves
    fn walk(&mut self, start: String, path: &str, original: &str) -> String {
        let home = self.home();
        let mut target = start;

        for segment in path.split(['\\', '/']).filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                if !target.eq_ignore_ascii_case(&home) {
                    if let Some(parent) = vfs::parent(&target) {
                        target = parent.to_string();
                    }
                }
                continue;
            }

            match self.fs.child_dir(&target, segment) {
                Some(next) => target = next,
                None if self.fs.child(&target, segment).is_some() => {
                    return "The directory name is invalid.".to_string();
                }
                None => return path_not_found(original),
            }
        }

        self.working_dir = target;
        String::new()
    }

    fn dir_listing(&self) -> String {
        let (dirs, files) = self.fs.partition(&self.working_dir);

        let mut out = format!(
            " Volume in drive C has no label.\n Volume Serial Number is {:04X}-{:04X}\n\n Directory of {}\n\n",
            self.volume_serial.0, self.volume_serial.1, self.working_dir
        );

        let here = synthesize_stamp(&self.working_dir);
        out.push_str(&format!("{}    <DIR>          .\n", here));
        out.push_str(&format!("{}    <DIR>          ..\n", here));
        for dir in &dirs {
            out.push_str(&format!(
                "{}    <DIR>          {}\n",
                synthesize_stamp(&vfs::join(&self.working_dir, dir)),
                dir
            ));
        }

        let mut total = 0u64;
        for file in &files {
            let path = vfs::join(&self.working_dir, file);
            let size = synthesize_size(&path);
            total += size;
            out.push_str(&format!(
                "{}    {:>14} {}\n",
                synthesize_stamp(&path),
                group_thousands(size),
                file
            ));
        }

        out.push_str(&format!(
            "{:>16} File(s) {:>14} bytes\n{:>16} Dir(s)  {} bytes free",
            files.len(),
            group_thousands(total),
            dirs.len() + 2,
            BYTES_FREE
        ));
        out
    }
}

fn type_file(arg: &str) -> String {
    let name = arg.trim().trim_matches('"');
    if name.is_empty() {
        return "The syntax of the command is incorrect.".to_string();
    }
    // Only the last path component matters for the canned set
    let file = name.rsplit(['\\', '/']).next().unwrap_or(name);
    if file.eq_ignore_ascii_case(canned::PROTECTED_FILE) {
        return "Access is denied.".to_string();
    }
    match canned::file_contents(file) {
        Some(contents) => contents.to_string(),
        None => format!("The system cannot find the file specified: {}", name),
    }
}

fn not_recognized(command: &str) -> String {
    format!(
        "'{}' is not recognized as an internal or external command, operable program or batch file.",
        command
    )
}

fn path_not_found(arg: &str) -> String {
    format!("The system cannot find the path specified: {}", arg)
}

/// Split off the first whitespace-delimited word
fn split_verb(command: &str) -> (&str, &str) {
    let command = command.trim_start();
    match command.find(char::is_whitespace) {
        Some(idx) => (&command[..idx], command[idx..].trim_start()),
        None => (command, ""),
    }
}

fn strip_prefix_ignore_case<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path.len() < prefix.len() || !path.is_char_boundary(prefix.len()) {
        return None;
    }
    let (head, tail) = path.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    if tail.is_empty() || tail.starts_with('\\') || tail.starts_with('/') {
        Some(tail)
    } else {
        None
    }
}

/// Deterministic FNV-1a hash so repeated listings agree with each other
fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.to_ascii_lowercase().as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

fn synthesize_size(path: &str) -> u64 {
    100 + fnv1a(path) % 1949
}

fn synthesize_stamp(path: &str) -> String {
    let h = fnv1a(path);
    let day = 1 + (h % 28);
    let month = 5 + ((h >> 8) % 2);
    let hour = 8 + ((h >> 16) % 9);
    let minute = (h >> 24) % 60;
    let (hour12, meridiem) = if hour >= 12 {
        (if hour == 12 { 12 } else { hour - 12 }, "PM")
    } else {
        (hour, "AM")
    };
    format!(
        "{:02}/{:02}/2025  {:02}:{:02} {}",
        month, day, hour12, minute, meridiem
    )
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
