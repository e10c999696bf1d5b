//! CLI tool for editing the proxy configuration
//!
//! Usage:
//!   hostproxy-config list [--domain <domain>] [--json]
//!   hostproxy-config add-upstream <domain> <path> <host> [options]
//!   hostproxy-config add-static <domain> <path> <folder> [options]
//!   hostproxy-config remove <domain> [path]
//!   hostproxy-config cert <domain> <name>|--clear

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use hostproxy::{Config, ConfigError, CorsPolicy, DomainConfig, RouteRule, StaticRule, UpstreamRule};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// CLI tool for managing proxy routes
#[derive(Parser, Debug)]
#[command(name = "hostproxy-config")]
#[command(author = "HostProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage domains and routes in config.json")]
struct Args {
    /// Volume holding config.json
    #[arg(long, env = "VOLUME_PATH", default_value = "./vol")]
    volume_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured routes
    List {
        /// Filter by domain
        #[arg(short = 'd', long)]
        domain: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Route a path to an upstream host
    AddUpstream {
        /// Domain name (e.g., api.example.com)
        domain: String,

        /// Path prefix (e.g., /api/)
        path: String,

        /// Upstream host
        host: String,

        /// Upstream port
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Connect to the upstream over TLS
        #[arg(long)]
        https: bool,

        /// Send the upstream host as Host instead of the requested domain
        #[arg(long)]
        rewrite_host: bool,

        /// Strip the matched prefix before forwarding
        #[arg(long)]
        relative: bool,

        /// Allowed origin suffix, or `*` for any (repeatable)
        #[arg(long)]
        cors: Vec<String>,

        /// Default header sent upstream, as KEY=VALUE (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,
    },

    /// Serve a path from a folder inside the volume
    AddStatic {
        /// Domain name
        domain: String,

        /// Path prefix
        path: String,

        /// Folder relative to the volume
        folder: String,

        /// Strip the matched prefix before resolving files
        #[arg(long)]
        relative: bool,

        /// Allowed origin suffix, or `*` for any (repeatable)
        #[arg(long)]
        cors: Vec<String>,
    },

    /// Remove a route, or the whole domain when no path is given
    Remove {
        /// Domain name
        domain: String,

        /// Path prefix to remove
        path: Option<String>,
    },

    /// Set or clear the certificate bundle of a domain
    Cert {
        /// Domain name
        domain: String,

        /// Bundle directory name under the certificates root
        #[arg(required_unless_present = "clear")]
        name: Option<String>,

        /// Remove the declared bundle
        #[arg(long, conflicts_with = "name")]
        clear: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = open_config(&args.volume_path)?;

    match args.command {
        Commands::List { domain, json } => {
            let domains: Vec<&(String, DomainConfig)> = config
                .domains
                .iter()
                .filter(|(name, _)| domain.as_deref().map_or(true, |d| d == name))
                .collect();

            if domains.is_empty() {
                match domain {
                    Some(domain) => println!("No routes found for domain: {}", domain),
                    None => println!("No routes found"),
                }
                return Ok(());
            }

            if json {
                let mut output = serde_json::Map::new();
                for (name, domain) in &domains {
                    output.insert(name.clone(), serde_json::to_value(domain)?);
                }
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{:<30} {:<20} {:<8} {:<40} {:<10}", "DOMAIN", "PATH", "TYPE", "TARGET", "CERT");
                println!("{}", "-".repeat(112));

                let mut total = 0;
                for (name, domain) in &domains {
                    let cert = domain.cert_name.as_deref().unwrap_or("-");
                    for (path, rule) in &domain.routes {
                        let (kind, target) = describe(rule);
                        println!("{:<30} {:<20} {:<8} {:<40} {:<10}", name, path, kind, target, cert);
                        total += 1;
                    }
                }

                println!("\nTotal: {} route(s) in {} domain(s)", total, domains.len());
            }
            return Ok(());
        }

        Commands::AddUpstream {
            domain,
            path,
            host,
            port,
            https,
            rewrite_host,
            relative,
            cors,
            headers,
        } => {
            let rule = RouteRule::Upstream(UpstreamRule {
                target_host: host,
                port,
                headers: parse_headers(&headers)?,
                use_https: https,
                cors: parse_cors(cors),
                rewrite_host,
                relative,
            });
            let (kind, target) = describe(&rule);
            config.domain_entry(&domain).set_route(path.clone(), rule);
            println!("Added {} route {}{} -> {}", kind, domain, path, target);
        }

        Commands::AddStatic {
            domain,
            path,
            folder,
            relative,
            cors,
        } => {
            let rule = RouteRule::Static(StaticRule {
                folder,
                cors: parse_cors(cors),
                relative,
            });
            let (kind, target) = describe(&rule);
            config.domain_entry(&domain).set_route(path.clone(), rule);
            println!("Added {} route {}{} -> {}", kind, domain, path, target);
        }

        Commands::Remove { domain, path } => match path {
            Some(path) => {
                let removed = config
                    .domain_mut(&domain)
                    .and_then(|d| d.remove_route(&path));
                if removed.is_none() {
                    eprintln!("No route {} found for {}", path, domain);
                    std::process::exit(1);
                }
                println!("Removed route {}{}", domain, path);
            }
            None => {
                if config.remove_domain(&domain).is_none() {
                    eprintln!("No domain {} found", domain);
                    std::process::exit(1);
                }
                println!("Removed domain {}", domain);
            }
        },

        Commands::Cert { domain, name, clear } => {
            let Some(entry) = config.domain_mut(&domain) else {
                bail!("No domain {} found", domain);
            };
            entry.cert_name = if clear { None } else { name };
            match &entry.cert_name {
                Some(name) => println!("Domain {} now uses certificate {}", domain, name),
                None => println!("Cleared certificate for {}", domain),
            }
        }
    }

    config.save(&args.volume_path)?;
    println!("Send SIGHUP to a running proxy to apply the change");

    Ok(())
}

/// Read config.json without ever replacing it; a missing file starts an empty document
fn open_config(volume_path: &Path) -> Result<Config> {
    match Config::read(volume_path) {
        Ok(config) => Ok(config),
        Err(ConfigError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
            Ok(Config::default())
        }
        Err(e) => Err(anyhow!(
            "cannot use {}: {}",
            Config::config_path(volume_path).display(),
            e
        )),
    }
}

fn describe(rule: &RouteRule) -> (&'static str, String) {
    match rule {
        RouteRule::Static(rule) => ("STATIC", rule.folder.clone()),
        RouteRule::Upstream(rule) => {
            let scheme = if rule.use_https { "https" } else { "http" };
            let target = match rule.port {
                Some(port) => format!("{}://{}:{}", scheme, rule.target_host, port),
                None => format!("{}://{}", scheme, rule.target_host),
            };
            ("DYNAMIC", target)
        }
    }
}

fn parse_cors(values: Vec<String>) -> Option<CorsPolicy> {
    if values.is_empty() {
        None
    } else if values.iter().any(|v| v == "*") {
        Some(CorsPolicy::Any)
    } else {
        Some(CorsPolicy::Origins(values))
    }
}

fn parse_headers(values: &[String]) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("header `{}` must be KEY=VALUE", pair))?;
            if key.trim().is_empty() {
                bail!("header `{}` has an empty name", pair);
            }
            Ok((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
