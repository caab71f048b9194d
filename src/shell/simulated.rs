//! Deterministic simulated execution.
//!
//! Known command/argument combinations map to fixed canned output. The same
//! input always yields byte-identical output, and nothing on the host is
//! touched.

use super::ExecutionResult;
use crate::error::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::security::Allowlist;

const SIM_CWD: &str = "/home/user/project";
const SIM_USER: &str = "user";
const SIM_HOST: &str = "terminal-forge";
const SIM_DATE: &str = "Thu Jan  1 00:00:00 UTC 2026";

const README: &str = "# project\n\nA sample Rust project.\n";
const CARGO_TOML: &str = "[package]\nname = \"project\"\nversion = \"0.1.0\"\nedition = \"2024\"\n\n[dependencies]\n";
const MAIN_RS: &str = "fn main() {\n    println!(\"Hello, world!\");\n}\n";

/// Files visible in the simulated working directory.
const SIM_FILES: &[(&str, &str)] = &[
    ("Cargo.toml", CARGO_TOML),
    ("README.md", README),
    ("src/main.rs", MAIN_RS),
];

#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    help_text: String,
}

impl SimulatedExecutor {
    pub fn new(allowlist: &Allowlist) -> Self {
        let width = allowlist
            .entries()
            .iter()
            .map(|e| e.command.len())
            .max()
            .unwrap_or(0);
        let mut help_text = String::from("Available commands:\n");
        for entry in allowlist.entries() {
            help_text.push_str(&format!(
                "  {:<width$}  {}\n",
                entry.command, entry.description
            ));
        }
        Self { help_text }
    }

    pub fn execute(&self, command: &str, args: &[String]) -> ExecutionResult {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match (command, args.as_slice()) {
            ("help", _) => ok(&self.help_text),
            ("clear", _) => ok("\x1b[2J\x1b[H"),
            ("pwd", _) => ok(&format!("{SIM_CWD}\n")),
            ("whoami", _) => ok(&format!("{SIM_USER}\n")),
            ("date", _) => ok(&format!("{SIM_DATE}\n")),
            ("cd", _) => ok(""),
            ("echo", words) => ok(&format!("{}\n", words.join(" "))),
            ("uname", flags) => uname(flags),
            ("ls", flags) => ls(flags),
            ("cat", files) => cat(files),
            ("which", [tool]) => which(tool),
            ("cargo", sub) => cargo(sub),
            ("rustc", ["--version"] | ["-V"]) => ok("rustc 1.85.0 (4d91de4e4 2025-02-17)\n"),
            ("git", sub) => git(sub),
            ("node", ["--version"] | ["-v"]) => ok("v20.11.0\n"),
            ("npm", ["--version"] | ["-v"]) => ok("10.2.4\n"),
            ("npm", ["test"]) => ok("\n> project@0.1.0 test\n> echo \"no tests\"\n\nno tests\n"),
            _ => not_available(command, &args),
        }
    }
}

fn ok(stdout: &str) -> ExecutionResult {
    ExecutionResult::exited(stdout, "", EXIT_SUCCESS)
}

fn fail(stderr: String) -> ExecutionResult {
    ExecutionResult::exited("", stderr, EXIT_FAILURE)
}

fn not_available(command: &str, args: &[&str]) -> ExecutionResult {
    let shown = if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    };
    fail(format!("{shown}: not available in simulation mode\n"))
}

fn uname(flags: &[&str]) -> ExecutionResult {
    match flags {
        [] | ["-s"] => ok("Linux\n"),
        ["-a"] => ok(&format!(
            "Linux {SIM_HOST} 6.1.0 #1 SMP PREEMPT_DYNAMIC x86_64 GNU/Linux\n"
        )),
        ["-r"] => ok("6.1.0\n"),
        ["-m"] => ok("x86_64\n"),
        ["-n"] => ok(&format!("{SIM_HOST}\n")),
        _ => not_available("uname", flags),
    }
}

fn ls(flags: &[&str]) -> ExecutionResult {
    let long = flags.iter().any(|f| matches!(*f, "-l"));
    let all = flags.iter().any(|f| matches!(*f, "-a" | "--all"));
    if let Some(path) = flags.iter().find(|f| !f.starts_with('-')) {
        return match path.trim_end_matches('/') {
            "src" => ok(if long {
                "total 4\n-rw-r--r-- 1 user user 45 Jan  1 00:00 main.rs\n"
            } else {
                "main.rs\n"
            }),
            "." => ls(&flags.iter().copied().filter(|f| f.starts_with('-')).collect::<Vec<_>>()),
            other => fail(format!(
                "ls: cannot access '{other}': No such file or directory\n"
            )),
        };
    }

    let listing = match (long, all) {
        (false, false) => "Cargo.toml  README.md  src  target\n",
        (false, true) => ".  ..  .git  .gitignore  Cargo.toml  README.md  src  target\n",
        (true, false) => concat!(
            "total 16\n",
            "-rw-r--r-- 1 user user   88 Jan  1 00:00 Cargo.toml\n",
            "-rw-r--r-- 1 user user   38 Jan  1 00:00 README.md\n",
            "drwxr-xr-x 2 user user 4096 Jan  1 00:00 src\n",
            "drwxr-xr-x 4 user user 4096 Jan  1 00:00 target\n",
        ),
        (true, true) => concat!(
            "total 28\n",
            "drwxr-xr-x 5 user user 4096 Jan  1 00:00 .\n",
            "drwxr-xr-x 3 user user 4096 Jan  1 00:00 ..\n",
            "drwxr-xr-x 8 user user 4096 Jan  1 00:00 .git\n",
            "-rw-r--r-- 1 user user    8 Jan  1 00:00 .gitignore\n",
            "-rw-r--r-- 1 user user   88 Jan  1 00:00 Cargo.toml\n",
            "-rw-r--r-- 1 user user   38 Jan  1 00:00 README.md\n",
            "drwxr-xr-x 2 user user 4096 Jan  1 00:00 src\n",
            "drwxr-xr-x 4 user user 4096 Jan  1 00:00 target\n",
        ),
    };
    ok(listing)
}

fn cat(files: &[&str]) -> ExecutionResult {
    let mut stdout = String::new();
    let mut stderr = String::new();
    for file in files.iter().filter(|f| !f.starts_with('-')) {
        match SIM_FILES.iter().find(|(name, _)| name == file) {
            Some((_, contents)) => stdout.push_str(contents),
            None => stderr.push_str(&format!("cat: {file}: No such file or directory\n")),
        }
    }
    let exit_code = if stderr.is_empty() { EXIT_SUCCESS } else { EXIT_FAILURE };
    ExecutionResult::exited(stdout, stderr, exit_code)
}

fn which(tool: &str) -> ExecutionResult {
    match tool {
        "cargo" | "rustc" | "rustup" => ok(&format!("/home/{SIM_USER}/.cargo/bin/{tool}\n")),
        "node" | "npm" => ok(&format!("/usr/local/bin/{tool}\n")),
        _ => ok(&format!("/usr/bin/{tool}\n")),
    }
}

fn cargo(sub: &[&str]) -> ExecutionResult {
    let release = sub.contains(&"--release");
    let profile = if release {
        "`release` profile [optimized]"
    } else {
        "`dev` profile [unoptimized + debuginfo]"
    };
    let target = if release { "release" } else { "debug" };
    let compiling = format!("   Compiling project v0.1.0 ({SIM_CWD})\n");
    let finished = format!("    Finished {profile} target(s) in 1.42s\n");

    match sub.first().copied() {
        Some("--version" | "-V") => ok("cargo 1.85.0 (d73d2caf9 2024-12-31)\n"),
        Some("build") => ok(&format!("{compiling}{finished}")),
        Some("check") => ok(&format!(
            "    Checking project v0.1.0 ({SIM_CWD})\n{finished}"
        )),
        Some("run") => ok(&format!(
            "{compiling}{finished}     Running `target/{target}/project`\nHello, world!\n"
        )),
        Some("test") => ok(&format!(
            "{compiling}{finished}     Running unittests src/main.rs (target/{target}/deps/project)\n\n\
             running 0 tests\n\n\
             test result: ok. 0 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.00s\n"
        )),
        Some("clean") => ok("     Removed 0 files\n"),
        Some("fmt") => ok(""),
        _ => not_available("cargo", sub),
    }
}

fn git(sub: &[&str]) -> ExecutionResult {
    match sub {
        ["status"] | ["status", "--short"] => ok(if sub.len() == 1 {
            "On branch main\nnothing to commit, working tree clean\n"
        } else {
            ""
        }),
        ["log", "--oneline", ..] => ok(concat!(
            "a1b2c3d Add command allowlist\n",
            "9f8e7d6 Initial commit\n",
        )),
        ["log", ..] => ok(concat!(
            "commit a1b2c3d4e5f60718293a4b5c6d7e8f9012345678\n",
            "Author: user <user@example.com>\n",
            "Date:   Thu Jan 1 00:00:00 2026 +0000\n\n",
            "    Add command allowlist\n\n",
            "commit 9f8e7d6c5b4a39281706f5e4d3c2b1a098765432\n",
            "Author: user <user@example.com>\n",
            "Date:   Wed Dec 31 00:00:00 2025 +0000\n\n",
            "    Initial commit\n",
        )),
        ["branch", ..] => ok("* main\n"),
        ["diff", ..] => ok(""),
        _ => not_available("git", sub),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimulatedExecutor {
        SimulatedExecutor::new(&Allowlist::builtin())
    }

    fn run(command: &str, args: &[&str]) -> ExecutionResult {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        sim().execute(command, &args)
    }

    #[test]
    fn test_deterministic_output() {
        let cases: &[(&str, &[&str])] = &[
            ("ls", &["-l", "-a"]),
            ("cargo", &["build", "--release"]),
            ("git", &["log"]),
            ("date", &[]),
            ("help", &[]),
        ];
        for (command, args) in cases {
            let first = run(command, args);
            let second = run(command, args);
            assert_eq!(first, second, "{command} {args:?} is not deterministic");
        }
    }

    #[test]
    fn test_cargo_build_release() {
        let result = run("cargo", &["build", "--release"]);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("Compiling project"));
        assert!(result.stdout.contains("`release` profile"));
    }

    #[test]
    fn test_echo() {
        let result = run("echo", &["hello", "world"]);
        assert_eq!(result.stdout, "hello world\n");
    }

    #[test]
    fn test_help_lists_allowlist() {
        let result = run("help", &[]);
        assert!(result.stdout.starts_with("Available commands:"));
        assert!(result.stdout.contains("cargo"));
        assert!(result.stdout.contains("Rust package manager"));
    }

    #[test]
    fn test_ls_variants() {
        assert_eq!(run("ls", &[]).stdout, "Cargo.toml  README.md  src  target\n");
        assert!(run("ls", &["-a"]).stdout.contains(".gitignore"));
        assert!(run("ls", &["-l"]).stdout.starts_with("total 16"));
        assert_eq!(run("ls", &["src/"]).stdout, "main.rs\n");
        assert_eq!(run("ls", &["missing"]).exit_code, 1);
    }

    #[test]
    fn test_cat() {
        let result = run("cat", &["src/main.rs"]);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("Hello, world!"));

        let result = run("cat", &["README.md", "nope.txt"]);
        assert_eq!(result.exit_code, 1);
        assert!(result.stdout.contains("# project"));
        assert!(result.stderr.contains("nope.txt"));
    }

    #[test]
    fn test_unrecognized_combination() {
        let result = run("git", &["show", "HEAD"]);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("not available in simulation mode"));
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn test_versions() {
        assert!(run("rustc", &["--version"]).stdout.starts_with("rustc "));
        assert_eq!(run("node", &["-v"]).stdout, "v20.11.0\n");
        assert_eq!(run("npm", &["--version"]).stdout, "10.2.4\n");
    }
}
