//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand};

/// Default application base URL; override with `--base-url` or
/// `CARDWATCH_BASE_URL`.
pub const DEFAULT_BASE_URL: &str = "https://eacct-buzzcard-sp.transactcampus.com/buzzcard";

/// Campus-card balance and transaction scraper behind federated SSO.
///
/// Cardwatch authenticates through the institution's single sign-on (with a
/// push second factor), persists the resulting session cookies encrypted at
/// rest, and scrapes balances and transaction history on demand.
#[derive(Parser, Debug)]
#[command(name = "cardwatch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Application base URL
    #[arg(long, env = "CARDWATCH_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level operations.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch account balances
    Balance,

    /// Fetch transaction history
    Transactions {
        /// Range start, e.g. "2/1/2026 12:00 AM"
        #[arg(long)]
        begin: Option<String>,

        /// Range end, e.g. "2/7/2026 12:00 AM"
        #[arg(long)]
        end: Option<String>,
    },

    /// Run the full interactive login (requires approving a push)
    Login {
        /// Account username
        #[arg(long)]
        username: String,
    },

    /// Manage persisted session cookies
    Cookies {
        #[command(subcommand)]
        action: CookiesAction,
    },
}

/// Cookie store operations.
#[derive(Subcommand, Debug)]
pub enum CookiesAction {
    /// Import a base64 bootstrap cookie blob (from a file, or stdin with
    /// "-")
    Import {
        /// Blob source path, or "-" for stdin
        #[arg(long, default_value = "-")]
        source: String,
    },

    /// Delete all persisted session cookies
    Clear,

    /// Print the persisted cookie file location
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_balance_parses() {
        let args = Args::try_parse_from(["cardwatch", "balance"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(matches!(args.command, Command::Balance));
        assert_eq!(args.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["cardwatch", "-v", "balance"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["cardwatch", "-vv", "balance"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_transactions_with_range() {
        let args = Args::try_parse_from([
            "cardwatch",
            "transactions",
            "--begin",
            "2/1/2026 12:00 AM",
            "--end",
            "2/7/2026 12:00 AM",
        ])
        .unwrap();
        match args.command {
            Command::Transactions { begin, end } => {
                assert_eq!(begin.as_deref(), Some("2/1/2026 12:00 AM"));
                assert_eq!(end.as_deref(), Some("2/7/2026 12:00 AM"));
            }
            other => panic!("expected transactions, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_transactions_range_optional() {
        let args = Args::try_parse_from(["cardwatch", "transactions"]).unwrap();
        match args.command {
            Command::Transactions { begin, end } => {
                assert!(begin.is_none());
                assert!(end.is_none());
            }
            other => panic!("expected transactions, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_login_requires_username() {
        let result = Args::try_parse_from(["cardwatch", "login"]);
        assert!(result.is_err());

        let args =
            Args::try_parse_from(["cardwatch", "login", "--username", "gburdell3"]).unwrap();
        match args.command {
            Command::Login { username } => assert_eq!(username, "gburdell3"),
            other => panic!("expected login, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_cookies_import_defaults_to_stdin() {
        let args = Args::try_parse_from(["cardwatch", "cookies", "import"]).unwrap();
        match args.command {
            Command::Cookies {
                action: CookiesAction::Import { source },
            } => assert_eq!(source, "-"),
            other => panic!("expected cookies import, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_base_url_flag() {
        let args = Args::try_parse_from([
            "cardwatch",
            "--base-url",
            "https://test.example.com/app",
            "balance",
        ])
        .unwrap();
        assert_eq!(args.base_url, "https://test.example.com/app");
    }

    #[test]
    fn test_cli_missing_subcommand_fails() {
        let result = Args::try_parse_from(["cardwatch"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["cardwatch", "--help"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let result = Args::try_parse_from(["cardwatch", "--invalid-flag", "balance"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
