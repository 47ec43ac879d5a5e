use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use svckit::components::{
    ComponentContext, ComponentDescription, ComponentInstance, ComponentMetadata, DependencyGraph,
};
use svckit::{
    ComponentRuntime, Filter, Framework, FrameworkEventKind, InterfaceMap, PropertyMap,
    PropertyValue, ServiceObject,
};
use svckit_bootstrap::{BrokerConfig, CliArgs};

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SvcKit Host - in-process service broker playground
#[derive(Parser)]
#[command(name = "svckit-host")]
#[command(about = "SvcKit Host - in-process service broker and component runtime")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a filter and evaluate it against a property set
    Filter {
        expression: String,
        /// Property as key=value (repeatable)
        #[arg(long = "prop", value_name = "KEY=VALUE")]
        props: Vec<String>,
        /// Compare keys case-sensitively
        #[arg(long)]
        match_case: bool,
    },
    /// Print activation order and cycles of the declared components
    Analyze,
    /// Run the declared components on a live framework
    Demo {
        /// Keep running until Ctrl+C / SIGTERM
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (SVCKIT__*) -> 4) CLI overrides
    let mut config = BrokerConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    svckit_bootstrap::init_logging_unified(&logging_config, Path::new(&config.host.home_dir));

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Demo { wait: false }) {
        Commands::Filter {
            expression,
            props,
            match_case,
        } => eval_filter(&expression, &props, match_case),
        Commands::Analyze => analyze(&config),
        Commands::Demo { wait } => run_demo(config, wait).await,
    }
}

fn parse_prop(raw: &str) -> Result<(String, PropertyValue)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("property '{raw}' must look like key=value"))?;
    let value = if let Ok(i) = value.parse::<i64>() {
        PropertyValue::from(i)
    } else if let Ok(f) = value.parse::<f64>() {
        PropertyValue::from(f)
    } else if let Ok(b) = value.parse::<bool>() {
        PropertyValue::from(b)
    } else {
        PropertyValue::from(value)
    };
    Ok((key.to_string(), value))
}

fn eval_filter(expression: &str, props: &[String], match_case: bool) -> Result<()> {
    let filter = Filter::parse(expression)?;
    let mut map = PropertyMap::new();
    for raw in props {
        let (key, value) = parse_prop(raw)?;
        map.insert(key, value);
    }

    let matched = if match_case {
        filter.matches_case_sensitive(&map)
    } else {
        filter.matches(&map)
    };
    println!("filter:  {filter}");
    println!("matches: {matched}");
    Ok(())
}

fn analyze(config: &BrokerConfig) -> Result<()> {
    let graph = DependencyGraph::from_metadata(&config.components.declared);
    let report = serde_json::json!({
        "order": graph.activation_order_lenient(),
        "edges": graph.edges().collect::<Vec<_>>(),
        "cycles": graph.cycles(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Publishes its configuration properties under every declared interface.
struct PropertyEcho {
    interfaces: Vec<String>,
    properties: Arc<PropertyMap>,
}

impl ComponentInstance for PropertyEcho {
    fn activate(&self, ctx: &ComponentContext) -> anyhow::Result<()> {
        tracing::info!(component = ctx.component_name(), "Echo component activated");
        Ok(())
    }

    fn deactivate(&self, ctx: &ComponentContext) -> anyhow::Result<()> {
        tracing::info!(component = ctx.component_name(), "Echo component deactivated");
        Ok(())
    }

    fn service(&self) -> Option<ServiceObject> {
        if self.interfaces.is_empty() {
            return None;
        }
        let mut map = InterfaceMap::new();
        for name in &self.interfaces {
            map.insert_named(name.clone(), self.properties.clone());
        }
        Some(ServiceObject::new(map))
    }
}

fn echo_description(metadata: ComponentMetadata) -> ComponentDescription {
    let interfaces = metadata.provided_interfaces().to_vec();
    ComponentDescription::new(metadata, move |ctx: &ComponentContext| {
        let instance: Arc<dyn ComponentInstance> = Arc::new(PropertyEcho {
            interfaces: interfaces.clone(),
            properties: Arc::new(ctx.properties().clone()),
        });
        Ok(instance)
    })
}

async fn run_demo(config: BrokerConfig, wait: bool) -> Result<()> {
    tracing::info!("Phase: framework start");
    let framework = Framework::builder().settings(config.framework.clone()).build();
    framework
        .system_context()
        .add_framework_listener(|event| match event.kind {
            FrameworkEventKind::Error | FrameworkEventKind::Warning => tracing::warn!(
                kind = ?event.kind,
                cause = event.cause.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
            _ => tracing::debug!(kind = ?event.kind, "{}", event.message),
        });
    framework.start();

    let runtime = ComponentRuntime::new(&framework, config.components.runtime.clone());
    let bundle = framework.install("svckit.demo");
    framework.start_bundle(&bundle)?;

    tracing::info!(
        count = config.components.declared.len(),
        "Phase: component registration"
    );
    let descriptions = config
        .components
        .declared
        .iter()
        .cloned()
        .map(echo_description)
        .collect();
    runtime.add_bundle_components(&bundle, descriptions)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&runtime.configurations())?
    );

    if wait {
        svckit_bootstrap::wait_for_shutdown().await?;
    }

    runtime.shutdown();
    framework.shutdown();
    tracing::info!("Demo finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_parse_into_typed_values() {
        assert_eq!(parse_prop("n=3").unwrap(), ("n".into(), PropertyValue::from(3i64)));
        assert_eq!(parse_prop("f=1.5").unwrap(), ("f".into(), PropertyValue::from(1.5)));
        assert_eq!(parse_prop("b=true").unwrap(), ("b".into(), PropertyValue::from(true)));
        assert_eq!(parse_prop("s=a=b").unwrap(), ("s".into(), PropertyValue::from("a=b")));
        assert!(parse_prop("novalue").is_err());
    }

    #[test]
    fn filter_command_rejects_bad_syntax() {
        assert!(eval_filter("(a=1", &[], false).is_err());
        assert!(eval_filter("(a=1)", &["a=1".to_string()], true).is_ok());
    }

    #[test]
    fn echo_component_publishes_declared_interfaces() {
        let framework = Framework::builder().build();
        framework.start();
        let runtime = ComponentRuntime::new(
            &framework,
            svckit::ComponentSettings {
                work_mode: svckit::components::WorkMode::Inline,
                ..Default::default()
            },
        );
        let bundle = framework.install("echo");
        framework.start_bundle(&bundle).unwrap();

        let metadata = ComponentMetadata::new("echo")
            .provides(&["demo.Echo"])
            .immediate(true)
            .property("greeting", "hi");
        runtime
            .add_bundle_components(&bundle, vec![echo_description(metadata)])
            .unwrap();

        let ctx = framework.context(&bundle);
        let reference = ctx.find_reference("demo.Echo").unwrap();
        let object = ctx.get_service(&reference).unwrap();
        let props = object
            .get_named("demo.Echo")
            .and_then(|v| v.downcast::<PropertyMap>().ok())
            .unwrap();
        assert_eq!(props.get("greeting").and_then(|v| v.as_str()), Some("hi"));
        runtime.shutdown();
        framework.shutdown();
    }
}
