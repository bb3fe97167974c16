use console::style;

pub fn print_success(msg: &str) {
    println!("{}", style(msg).green());
}

pub fn print_error(msg: &str) {
    eprintln!("{}", style(msg).red().bold());
}

/// One line of the usage block: a command and what it does.
pub fn print_usage(cmd: &str, desc: &str) {
    println!("   {:<28} {}", style(cmd).cyan(), style(desc).dim());
}
