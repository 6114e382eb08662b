//! Per-edge payload for the off-node execution paths.

use tracing::warn;

use nimbus_castore::path::{has_path_prefix, make_path_relative};

use crate::config::{BuildConfig, RbeConfig};
use crate::parser::{self, SUPPORTED_REMOTE_EXECUTE_COMMANDS};

/// Read-only view of a build edge, as handed over by the driver. `inputs`
/// excludes order-only dependencies.
#[derive(Clone, Debug, Default)]
pub struct Edge {
    pub rule_name: String,
    /// The evaluated command line.
    pub command: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub use_console: bool,
}

/// Everything the remote worker needs to execute one edge.
#[derive(Clone, Debug)]
pub struct RemoteSpawn {
    pub command: String,
    pub origin_command: String,
    pub rule: String,
    pub arguments: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub can_remote: bool,
}

impl RemoteSpawn {
    pub fn from_edge(edge: &Edge, config: &BuildConfig) -> RemoteSpawn {
        RemoteSpawn {
            command: edge.command.clone(),
            origin_command: edge.command.clone(),
            rule: edge.rule_name.clone(),
            arguments: parser::split_command(&edge.command),
            inputs: edge.inputs.clone(),
            outputs: edge.outputs.clone(),
            can_remote: can_execute_remotely(edge, &config.rbe_config),
        }
    }

    /// Run the dependency-discovery command for this edge and return the
    /// headers it reads. Dependency-file products move into `outputs` so
    /// they are staged alongside the object files.
    pub async fn gather_header_files(&mut self) -> Vec<String> {
        let tokens = parser::split_command(&self.command);
        let result = parser::parse_command(&tokens);
        if !result.is_compiler_command {
            return vec![];
        }
        for product in &result.deps_command_products {
            self.outputs.push(product.clone());
        }
        let headers: Vec<String> = parser::parse_headers(&result).await.into_iter().collect();
        if headers.is_empty() {
            warn!("command [{}] found no header files", self.origin_command);
        }
        self.clean_command();
        headers
    }

    /// Strip shell escapes (`\<space>`, `\\\"`) left in the evaluated
    /// command before it is re-split for remote execution.
    pub fn clean_command(&mut self) {
        if !self.origin_command.contains('\\') {
            return;
        }
        let bytes = self.origin_command.as_bytes();
        let mut cleaned = String::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                if i + 1 < bytes.len() && bytes[i + 1] == b' ' {
                    i += 1;
                } else if i + 3 < bytes.len()
                    && bytes[i + 1] == b'\\'
                    && bytes[i + 2] == b'\\'
                    && bytes[i + 3] == b'"'
                {
                    i += 3;
                }
                i += 1;
                continue;
            }
            cleaned.push(bytes[i] as char);
            i += 1;
        }
        self.origin_command = cleaned.clone();
        self.command = cleaned;
        self.arguments = parser::split_command(&self.command);
    }

    /// Rewrite absolute project paths (and the path portion of `-I`/`-L`/
    /// `-l` options) to be relative to the build's working directory. Tool
    /// paths and symbols are untouched. Applied once the edge has been
    /// chosen for off-node execution.
    pub fn convert_paths_to_relative(&mut self, config: &RbeConfig) {
        for input in &mut self.inputs {
            if classify_argument(input, config) == ArgumentKind::AbsoluteProjectPath {
                *input = make_path_relative(input, &config.cwd);
            }
        }
        for output in &mut self.outputs {
            if classify_argument(output, config) == ArgumentKind::AbsoluteProjectPath {
                *output = make_path_relative(output, &config.cwd);
            }
        }
        for arg in &mut self.arguments {
            match classify_argument(arg, config) {
                ArgumentKind::AbsoluteProjectPath => {
                    *arg = make_path_relative(arg, &config.cwd);
                }
                ArgumentKind::OptionWithPath => {
                    let (flag, path) = arg.split_at(2);
                    *arg = format!("{}{}", flag, make_path_relative(path, &config.cwd));
                }
                _ => {}
            }
        }
        self.command = self.arguments.join(" ");
    }
}

/// Classification of one command-line argument for path rewriting.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ArgumentKind {
    /// Absolute and under the project root.
    AbsoluteProjectPath,
    /// Absolute but outside the project root.
    ToolPath,
    RelativePath,
    /// `-I`, `-L` or `-l` with an attached path.
    OptionWithPath,
    Symbol,
    Empty,
}

fn classify_argument(argument: &str, config: &RbeConfig) -> ArgumentKind {
    let mut chars = argument.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return ArgumentKind::Empty,
    };
    if first == '/' {
        return if has_path_prefix(argument, &config.project_root) {
            ArgumentKind::AbsoluteProjectPath
        } else {
            ArgumentKind::ToolPath
        };
    }
    if first.is_ascii_alphabetic() || first == '_' {
        return ArgumentKind::RelativePath;
    }
    if first == '-' && matches!(chars.next(), Some('I') | Some('L') | Some('l')) {
        return ArgumentKind::OptionWithPath;
    }
    ArgumentKind::Symbol
}

/// First match wins: explicit local-only rules, then the fuzzy substring
/// filters, then the known compiler prefixes. Everything else stays local.
pub fn can_execute_remotely(edge: &Edge, config: &RbeConfig) -> bool {
    if config.local_only_rules.contains(&edge.rule_name) {
        return false;
    }
    for filter in &config.fuzzy_rules {
        if edge.command.contains(filter.as_str()) || edge.rule_name.contains(filter.as_str()) {
            return false;
        }
    }
    SUPPORTED_REMOTE_EXECUTE_COMMANDS
        .iter()
        .any(|prefix| edge.command.contains(prefix))
}

/// Cache eligibility shares the execution table.
pub fn can_cache_remotely(edge: &Edge, config: &RbeConfig) -> bool {
    can_execute_remotely(edge, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RbeConfig {
        RbeConfig {
            project_root: "/p".to_string(),
            cwd: "/p/build".to_string(),
            ..Default::default()
        }
    }

    fn edge(rule: &str, command: &str) -> Edge {
        Edge {
            rule_name: rule.to_string(),
            command: command.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn compiler_commands_are_remote_executable() {
        let config = config();
        assert!(can_execute_remotely(&edge("cxx", "g++ -c a.cc -o a.o"), &config));
        assert!(can_execute_remotely(&edge("cc", "gcc -c a.c"), &config));
        assert!(!can_execute_remotely(&edge("link", "ld -o prog a.o"), &config));
    }

    #[test]
    fn local_only_rules_win() {
        let mut config = config();
        config.local_only_rules.insert("cxx".to_string());
        assert!(!can_execute_remotely(&edge("cxx", "g++ -c a.cc"), &config));
    }

    #[test]
    fn fuzzy_rules_match_command_and_rule_name() {
        let mut config = config();
        config.fuzzy_rules.insert("codegen".to_string());
        assert!(!can_execute_remotely(
            &edge("cxx", "g++ -c codegen_out.cc"),
            &config
        ));
        assert!(!can_execute_remotely(&edge("codegen_cc", "g++ -c a.cc"), &config));
    }

    #[test]
    fn unknown_commands_stay_local() {
        let config = config();
        assert!(!can_execute_remotely(&edge("special", "mytool a b"), &config));
    }

    #[test]
    fn cache_table_matches_execute_table() {
        let config = config();
        let e = edge("cxx", "clang++ -c a.cc");
        assert_eq!(
            can_execute_remotely(&e, &config),
            can_cache_remotely(&e, &config)
        );
    }

    #[test]
    fn path_rewriting_touches_only_project_paths() {
        let config = config();
        let e = Edge {
            rule_name: "cxx".to_string(),
            command: "/usr/bin/g++ -I/p/include -c /p/build/a.cc -o a.o".to_string(),
            inputs: vec!["/p/build/a.cc".to_string()],
            outputs: vec!["a.o".to_string()],
            use_console: false,
        };
        let mut spawn = RemoteSpawn::from_edge(&e, &BuildConfig {
            rbe_config: config.clone(),
            ..Default::default()
        });
        spawn.convert_paths_to_relative(&config);
        // The tool path is untouched, the project paths are relative now.
        assert_eq!(spawn.command, "/usr/bin/g++ -I../include -c a.cc -o a.o");
        assert_eq!(spawn.inputs, vec!["a.cc"]);
    }

    #[test]
    fn clean_command_strips_escapes() {
        let mut spawn = RemoteSpawn {
            command: String::new(),
            origin_command: "gcc -DNAME=\\\\\\\"x\\\\\\\" -c a\\ b.c".to_string(),
            rule: "cc".to_string(),
            arguments: vec![],
            inputs: vec![],
            outputs: vec![],
            can_remote: true,
        };
        spawn.clean_command();
        // An escaped space disappears entirely: the remote side re-splits
        // on whitespace, so the name has to come out as one token.
        assert_eq!(spawn.command, "gcc -DNAME=\"x\" -c ab.c");
    }
}
