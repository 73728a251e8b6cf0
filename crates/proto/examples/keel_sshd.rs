//! Development SSH server.
//!
//! ```text
//! keel_sshd [-p port] [-o key=value]...
//! ```
//!
//! Accepts password "keel" for any user, serves an echo shell and the
//! SFTP subsystem. Not for production use.

use keel_platform::KeelResult;
use keel_proto::ssh::mux::{Command, CommandContext, CommandExit, CommandFactory};
use keel_proto::ssh::server::SshServer;
use keel_proto::ssh::{Config, PasswordAuthenticator, StaticKeyProvider};
use std::process::exit;
use std::sync::Arc;

struct DemoPassword;

#[async_trait::async_trait]
impl PasswordAuthenticator for DemoPassword {
    async fn authenticate(&self, _username: &str, password: &str) -> KeelResult<bool> {
        Ok(password == "keel")
    }
}

struct EchoShell;

#[async_trait::async_trait]
impl Command for EchoShell {
    async fn run(self: Box<Self>, mut ctx: CommandContext) -> KeelResult<CommandExit> {
        while let Some(data) = ctx.stdin.recv().await {
            ctx.stdout.write(&data).await?;
        }
        Ok(CommandExit::Status(0))
    }
}

struct EchoShellFactory;

impl CommandFactory for EchoShellFactory {
    fn create(&self, _command: Option<&str>) -> KeelResult<Box<dyn Command>> {
        Ok(Box::new(EchoShell))
    }
}

fn usage() -> ! {
    eprintln!("usage: keel_sshd [-p port] [-o key=value]...");
    exit(2);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut port = 2222u16;
    let mut config = Config::default();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-p" => {
                let Some(value) = args.next() else { usage() };
                port = match value.parse() {
                    Ok(port) => port,
                    Err(_) => {
                        eprintln!("invalid port: {}", value);
                        exit(2);
                    }
                };
            }
            "-o" => {
                let Some(value) = args.next() else { usage() };
                if let Err(e) = config.apply(&value) {
                    eprintln!("{}", e);
                    exit(2);
                }
            }
            _ => usage(),
        }
    }

    let provider = match StaticKeyProvider::ephemeral() {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            eprintln!("failed to generate host key: {}", e);
            exit(1);
        }
    };

    let mut server =
        match SshServer::bind_with_config(&format!("127.0.0.1:{}", port), config, provider).await
        {
            Ok(server) => server,
            Err(e) => {
                eprintln!("failed to bind: {}", e);
                exit(1);
            }
        };
    server.set_password_authenticator(Arc::new(DemoPassword));
    server.set_command_factory(Arc::new(EchoShellFactory));

    println!("keel_sshd listening on 127.0.0.1:{} (password: keel)", port);

    loop {
        match server.accept().await {
            Ok(mut session) => {
                tokio::spawn(async move {
                    if session.authenticate().await.is_ok() {
                        let _ = session.run().await;
                    }
                });
            }
            Err(e) => {
                eprintln!("accept failed: {}", e);
            }
        }
    }
}
