//! CLI sign-in: Google consent URL, then code exchange

use std::io::{BufRead, Write};

use anyhow::{bail, Result};

use crate::api::ApiClient;
use crate::session::SessionController;

/// Sign in with an authorization code. Without one, print the consent URL and
/// ask for the code the browser redirect carries.
pub async fn login(api: &ApiClient, session: &SessionController, code: Option<String>) -> Result<()> {
    let code = match code {
        Some(code) => code,
        None => {
            let consent = api.google_url().await?;
            println!();
            println!("\x1b[1;36m🔐 To login, open this URL in your browser:\x1b[0m");
            println!();
            println!("   \x1b[4m{}\x1b[0m", consent.url);
            println!();
            print!("Paste the code from the redirect: ");
            std::io::stdout().flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line.trim().to_string()
        }
    };

    if code.is_empty() {
        bail!("No authorization code given");
    }

    let tokens = api.exchange_code(&code).await?;
    session.sign_in(tokens.access_token, &tokens.refresh_token)?;

    println!();
    println!("\x1b[1;32m✅ Login successful!\x1b[0m");
    println!("\x1b[90mSigned in as {} <{}>\x1b[0m", tokens.user.name, tokens.user.email);
    Ok(())
}

pub fn logout(session: &SessionController) {
    session.sign_out();
    println!("\x1b[32m✅ Logged out successfully\x1b[0m");
}

/// Show who the stored session belongs to
pub async fn whoami(api: &ApiClient, session: &SessionController) -> Result<()> {
    if !session.has_session() {
        println!("\x1b[33m✗ Not logged in\x1b[0m");
        println!("Run '\x1b[1mdocit login\x1b[0m' to authenticate");
        return Ok(());
    }

    let user = session.with_auth_retry(move |token| async move { api.me(&token).await }).await?;
    println!("\x1b[32m✓ Logged in\x1b[0m");
    println!("Server: {}", api.base_url());
    println!("User:   {} <{}>", user.name, user.email);
    println!("ID:     {}", user.id);
    Ok(())
}
