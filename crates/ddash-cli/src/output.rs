//! CLI output styling for ddash

use colored::Colorize;
use ddash_proxy::Decision;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Print proxy environment as `KEY=VALUE` lines on stdout.
pub fn print_env(vars: &[(String, String)]) {
    for (key, value) in vars {
        println!("{}={}", key, value);
    }
}

fn styled(decision: Decision) -> colored::ColoredString {
    match decision {
        Decision::Allow => "allow".green(),
        Decision::Always => "always".green().bold(),
        Decision::Deny => "deny".red(),
        Decision::Never => "never".red().bold(),
    }
}

/// Print the session's decisions on stderr.
pub fn print_summary(decisions: &HashMap<String, Decision>, saved: usize, silent: bool) {
    if silent {
        return;
    }

    eprintln!();
    if decisions.is_empty() {
        eprintln!("{}", "No network requests.".truecolor(150, 150, 150));
        return;
    }

    eprintln!("{}", "Network decisions:".white().bold());
    let sorted: BTreeMap<_, _> = decisions.iter().collect();
    for (domain, decision) in sorted {
        eprintln!("  {:<8} {}", styled(*decision), domain);
    }

    if saved > 0 {
        eprintln!(
            "{}",
            format!("Saved {} decision(s) to project config.", saved).truecolor(150, 150, 150)
        );
    }
}

/// Print saved domain decisions from a project config.
pub fn print_domains(path: &Path, domains: &BTreeMap<String, String>) {
    if domains.is_empty() {
        eprintln!("No saved domains in {}", path.display());
        return;
    }

    for (domain, token) in domains {
        match token.parse::<Decision>() {
            Ok(decision) => println!("{:<8} {}", styled(decision), domain),
            Err(_) => println!("{:<8} {}", token.yellow(), domain),
        }
    }
}
