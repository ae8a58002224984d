use super::parse::{Config, ProcessConfig, RestartPolicy};

impl Config {
    /// Starter document written by `multirun init`.
    pub fn sample() -> Config {
        let say_hello = ProcessConfig::shell(
            "say-hello",
            ["echo hello...", "sleep 1", "echo ...world", "sleep 1"],
        )
        .with_restart(RestartPolicy::Always);

        let print_the_date = ProcessConfig::program("print-the-date", "date");

        let mut greet = ProcessConfig::program("greet", "echo").with_restart(RestartPolicy::OnFail);
        greet.args.push("Hello, ${NAME}!".to_string());
        greet.envs.insert("NAME".to_string(), "multirun".to_string());

        Config {
            procs: vec![say_hello, print_the_date, greet],
        }
    }
}
