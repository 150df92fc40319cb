/// Command-line arguments for the `sqlbridge` binary
///
/// Usage: `sqlbridge [--config PATH] [--dsn NAME]`
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    /// Explicit configuration file
    pub config: Option<PathBuf>,
    /// Overrides `connection.default_dsn`
    pub dsn: Option<String>,
    pub help: bool,
}

pub const USAGE: &str = "Usage: sqlbridge [--config PATH] [--dsn NAME]";

impl CliArgs {
    /// Parses arguments, excluding the program name.
    pub fn parse<I, S>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = CliArgs::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    let path = args.next().ok_or("--config requires a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--dsn" => {
                    parsed.dsn = Some(args.next().ok_or("--dsn requires a name")?);
                }
                "--help" | "-h" => parsed.help = true,
                other => {
                    if let Some(path) = other.strip_prefix("--config=") {
                        parsed.config = Some(PathBuf::from(path));
                    } else if let Some(dsn) = other.strip_prefix("--dsn=") {
                        parsed.dsn = Some(dsn.to_string());
                    } else {
                        return Err(format!("Unknown argument: {}", other));
                    }
                }
            }
        }
        Ok(parsed)
    }
}
