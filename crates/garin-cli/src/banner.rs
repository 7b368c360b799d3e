use garin_core::VERSION;

pub fn print_banner() {
    eprintln!(
        "\n  {} {}  {}\n",
        console::style("garin").cyan().bold(),
        console::style(format!("v{VERSION}")).dim(),
        console::style("passive http/tls destination sniffer").dim(),
    );
}
