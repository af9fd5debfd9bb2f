use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "relay-proxy")]
#[command(author, version, about = "Forwarding HTTP proxy with CONNECT tunnels and upstream chaining", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行代理
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "relay-proxy.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
    /// 生成默认配置模板
    Template {
        /// 输出文件路径（不指定则打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["relay-proxy", "run", "--config", "proxy.toml"]).unwrap();
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run { config } => assert_eq!(config, "proxy.toml"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_log_level() {
        let cli = Cli::try_parse_from(["relay-proxy", "check", "-c", "a.toml", "--log-level", "debug"])
            .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Check { .. }));
    }

    #[test]
    fn test_template_output_optional() {
        let cli = Cli::try_parse_from(["relay-proxy", "template"]).unwrap();
        assert!(matches!(cli.command, Commands::Template { output: None }));
        assert!(Cli::try_parse_from(["relay-proxy", "check"]).is_err());
    }
}
