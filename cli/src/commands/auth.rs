//! `ocifs login` / `ocifs logout` - manage saved registry logins.

use std::io::BufRead;

use clap::Args;
use ocifs_runtime::oci::{Credential, CredentialStore};

use super::DEFAULT_REGISTRY;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry host (default: docker.io)
    pub server: Option<String>,

    /// Username for basic authentication
    #[arg(short, long, conflicts_with = "token")]
    pub username: Option<String>,

    /// Password for basic authentication
    #[arg(short, long, conflicts_with = "password_stdin")]
    pub password: Option<String>,

    /// Read the password, or the token with --token, from stdin
    #[arg(long)]
    pub password_stdin: bool,

    /// Log in with a bearer token instead of a username and password
    #[arg(long)]
    pub token: bool,
}

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry host (default: docker.io)
    pub server: Option<String>,
}

fn server_or_default(server: Option<String>) -> String {
    server
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_REGISTRY.to_string())
}

/// Read one line from stdin, showing `label` on stderr first.
fn read_line(label: Option<&str>) -> std::io::Result<String> {
    if let Some(label) = label {
        eprint!("{label}: ");
    }
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Credential described by the login flags, prompting for what is missing.
fn credential_from(args: &LoginArgs) -> Result<Credential, Box<dyn std::error::Error>> {
    let secret = |label: &str| -> std::io::Result<String> {
        match (&args.password, args.password_stdin) {
            (Some(secret), _) => Ok(secret.clone()),
            (None, true) => read_line(None),
            (None, false) => read_line(Some(label)),
        }
    };

    let credential = if args.token {
        Credential::Bearer(secret("Token")?)
    } else {
        let username = match &args.username {
            Some(username) => username.clone(),
            None if args.password_stdin => {
                return Err("--password-stdin needs --username".into());
            }
            None => read_line(Some("Username"))?,
        };
        Credential::basic(username, secret("Password")?)
    };

    let complete = match &credential {
        Credential::Basic { username, password } => !username.is_empty() && !password.is_empty(),
        Credential::Bearer(token) => !token.is_empty(),
        Credential::Anonymous => false,
    };
    if !complete {
        return Err("Username and password, or a token, are required".into());
    }
    Ok(credential)
}

pub async fn login(args: LoginArgs) -> Result<(), Box<dyn std::error::Error>> {
    let credential = credential_from(&args)?;
    let server = server_or_default(args.server);

    let store = CredentialStore::open_default()?;
    let replaced = store.credential(&server)?.is_some();
    store.save(&server, &credential)?;

    let verb = if replaced { "Updated" } else { "Saved" };
    println!("{} login for {} in {}", verb, server, store.path().display());
    Ok(())
}

pub async fn logout(args: LogoutArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = server_or_default(args.server);
    let store = CredentialStore::open_default()?;
    if store.forget(&server)? {
        println!("Removed login for {}", server);
    } else {
        println!("No saved login for {}", server);
    }
    Ok(())
}
