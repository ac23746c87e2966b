use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use istio_config::{
    host,
    index::Index,
    policy::Policy,
    validation::{read_manifests, validate_manifests, Document, Resource},
};
use std::{path::PathBuf, time::Duration};

#[derive(Parser)]
#[clap(name = "istio-config", version)]
struct Args {
    /// The tracing filter used for logs
    #[clap(long, env = "ISTIO_CONFIG_LOG", default_value = "info")]
    log_level: kubert::LogFilter,

    /// The logging format
    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch Gateways and Policies in a cluster and index them
    Controller {
        #[clap(flatten)]
        client: kubert::ClientArgs,

        #[clap(flatten)]
        admin: kubert::AdminArgs,

        /// Print the index when it changes, at most this often
        #[clap(long, parse(try_from_str = humantime::parse_duration))]
        dump_interval: Option<Duration>,
    },

    /// Validate the Gateways and Policies in YAML manifests
    Validate {
        /// The namespace of resources that do not set one
        #[clap(long, default_value = "default")]
        namespace: String,

        #[clap(required = true)]
        files: Vec<PathBuf>,
    },

    /// Check whether a Gateway server host admits a virtual service host
    MatchHost {
        #[clap(long)]
        server_host: String,

        /// The namespace of the Gateway declaring the server
        #[clap(long)]
        gateway_namespace: String,

        /// The namespace of the virtual service
        #[clap(long)]
        namespace: String,

        #[clap(long)]
        host: String,
    },

    /// Check which origin JWT methods of the Policies in a manifest are
    /// triggered for a request path
    Trigger {
        #[clap(long)]
        file: PathBuf,

        #[clap(long)]
        path: String,

        /// The namespace of resources that do not set one
        #[clap(long, default_value = "default")]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        command,
    } = Args::parse();

    match command {
        Command::Controller {
            client,
            admin,
            dump_interval,
        } => {
            let mut rt = kubert::Runtime::builder()
                .with_log(log_level, log_format)
                .with_admin(admin)
                .with_client(client)
                .build()
                .await?;

            let index = Index::default();
            let indexing = index.spawn_index_tasks(&mut rt);
            if let Some(every) = dump_interval {
                index.dump_index(every);
            }
            tokio::spawn(async move {
                if let Err(error) = indexing.await {
                    tracing::error!(%error, "indexing failed");
                }
            });

            tracing::info!("watching Gateways and Policies");
            if rt.run().await.is_err() {
                bail!("aborted");
            }
            Ok(())
        }

        Command::Validate { namespace, files } => {
            log_format.try_init(log_level)?;
            let mut failed = 0;
            for file in files {
                let yaml = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let reports = validate_manifests(&yaml, &namespace)
                    .with_context(|| format!("failed to load {}", file.display()))?;
                for report in reports {
                    if report.is_valid() {
                        println!(
                            "{}: {} {}/{}: ok",
                            file.display(),
                            report.kind,
                            report.namespace,
                            report.name
                        );
                        continue;
                    }
                    failed += report.errors.len();
                    for error in &report.errors {
                        println!(
                            "{}: {} {}/{}: {}",
                            file.display(),
                            report.kind,
                            report.namespace,
                            report.name,
                            error
                        );
                    }
                }
            }
            if failed > 0 {
                bail!("found {failed} configuration errors");
            }
            Ok(())
        }

        Command::MatchHost {
            server_host,
            gateway_namespace,
            namespace,
            host,
        } => {
            log_format.try_init(log_level)?;
            let matched = host::matches(&server_host, &gateway_namespace, &namespace, &host);
            println!("{matched}");
            Ok(())
        }

        Command::Trigger {
            file,
            path,
            namespace,
        } => {
            log_format.try_init(log_level)?;
            let yaml = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            for policy in load_policies(&yaml, &namespace)? {
                for (i, jwt) in policy.origins.iter().enumerate() {
                    println!(
                        "{}/{}: origin {} ({}): {}",
                        policy.namespace,
                        policy.name,
                        i,
                        jwt.issuer.as_deref().unwrap_or("-"),
                        if jwt.trigger_rules.should_validate(&path) {
                            "validate"
                        } else {
                            "skip"
                        }
                    );
                }
                println!(
                    "{}/{}: origin JWT required: {}",
                    policy.namespace,
                    policy.name,
                    policy.origin_required(&path)
                );
            }
            Ok(())
        }
    }
}

/// Loads every `Policy` in a manifest, logging configuration errors.
fn load_policies(yaml: &str, default_ns: &str) -> Result<Vec<Policy>> {
    let mut policies = Vec::new();
    for Document { index, resource } in read_manifests(yaml, default_ns)? {
        let policy = match resource {
            Resource::Policy(policy) => policy,
            Resource::Gateway(_) => continue,
        };
        let validated =
            Policy::from_resource(policy).with_context(|| format!("document {index}"))?;
        for error in &validated.errors {
            tracing::warn!(
                ns = %validated.value.namespace,
                name = %validated.value.name,
                %error,
                "invalid Policy configuration"
            );
        }
        policies.push(validated.value);
    }
    Ok(policies)
}
