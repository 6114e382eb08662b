//! Compile-command parsing.
//!
//! Turns a tool-chain command line into a deterministic description of the
//! action: which compiler family it is, which files it produces, whether it
//! can run remotely at all, and the preprocessor-only command used to
//! discover the headers it reads.

use std::collections::{BTreeSet, VecDeque};

use tempfile::NamedTempFile;
use tracing::warn;

/// The command-line prefixes that mark an edge as remote-executable.
pub const SUPPORTED_REMOTE_EXECUTE_COMMANDS: [&str; 6] =
    ["gcc ", "g++ ", "c++ ", "clang ", "clang++ ", "javac "];

const GCC_COMPILERS: [&str; 5] = ["gcc", "g++", "c++", "clang", "clang++"];
const SUN_CPP_COMPILERS: [&str; 1] = ["CC"];
const AIX_COMPILERS: [&str; 5] = ["xlc", "xlc++", "xlC", "xlCcore", "xlc++core"];
const C_COMPILERS: [&str; 3] = ["cc", "c89", "c99"];
const JAVA_COMPILERS: [&str; 2] = ["javac", "java"];

const GCC_DEFAULT_DEPS: [&str; 1] = ["-M"];
const SUN_CPP_DEFAULT_DEPS: [&str; 1] = ["-xM"];
const AIX_DEFAULT_DEPS: [&str; 3] = ["-qsyntaxonly", "-M", "-MF"];

const GCC_SUPPORTED_LANGUAGES: [&str; 6] = [
    "c",
    "c++",
    "c-header",
    "c++-header",
    "c++-system-header",
    "c++-user-header",
];

/// What a matched option does to the parse.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Rule {
    /// Dependency-related flags that would fight with our own `-M` pass.
    InterferesWithDeps,
    /// Option taking an input path (`-I`, `-include`, ...).
    InputPath,
    /// `-D`, attached or detached.
    Macro,
    /// `-c`: this is a compile step.
    Compile,
    /// `-o` and friends: the argument is a produced file.
    RedirectsOutput,
    /// `-MF`/`-MT`/`-MQ`: the argument is a dependency-file product.
    RedirectsDepsOutput,
    /// `-Wp,`/`-Xpreprocessor`: arguments handed to the preprocessor.
    PreprocessorArg,
    /// `-x`: selects the language; only C/C++ flavors are supported.
    GccLanguage,
    /// Anything we cannot reproduce remotely.
    Unsupported,
}

/// Option tables, longest-prefix-first within a shared prefix (note e.g.
/// `-MMD` before `-MD` before `-M`).
type RuleTable = &'static [(&'static str, Rule)];

const GCC_RULES: RuleTable = &[
    ("-MMD", Rule::InterferesWithDeps),
    ("-MD", Rule::InterferesWithDeps),
    ("-MM", Rule::InterferesWithDeps),
    ("-MG", Rule::InterferesWithDeps),
    ("-MP", Rule::InterferesWithDeps),
    ("-MV", Rule::InterferesWithDeps),
    ("-MF", Rule::RedirectsDepsOutput),
    ("-MT", Rule::RedirectsDepsOutput),
    ("-MQ", Rule::RedirectsDepsOutput),
    ("-M", Rule::InterferesWithDeps),
    ("-Wmissing-include-dirs", Rule::InterferesWithDeps),
    ("-Werror=missing-include-dirs", Rule::InterferesWithDeps),
    ("-c", Rule::Compile),
    ("-D", Rule::Macro),
    ("-o", Rule::RedirectsOutput),
    ("-include", Rule::InputPath),
    ("-imacros", Rule::InputPath),
    ("-iquote", Rule::InputPath),
    ("-isystem", Rule::InputPath),
    ("-idirafter", Rule::InputPath),
    ("-iprefix", Rule::InputPath),
    ("-isysroot", Rule::InputPath),
    ("-I", Rule::InputPath),
    ("--sysroot", Rule::InputPath),
    ("-Wp,", Rule::PreprocessorArg),
    ("-Xpreprocessor", Rule::PreprocessorArg),
    ("-x", Rule::GccLanguage),
];

/// Applied to the contents of `-Wp,` / `-Xpreprocessor` lists.
const GCC_PREPROCESSOR_RULES: RuleTable = &[
    ("-MMD", Rule::InterferesWithDeps),
    ("-MD", Rule::InterferesWithDeps),
    ("-MM", Rule::InterferesWithDeps),
    ("-MG", Rule::InterferesWithDeps),
    ("-MP", Rule::InterferesWithDeps),
    ("-MV", Rule::InterferesWithDeps),
    ("-MF", Rule::RedirectsDepsOutput),
    ("-MT", Rule::RedirectsDepsOutput),
    ("-MQ", Rule::RedirectsDepsOutput),
    ("-M", Rule::InterferesWithDeps),
    ("-o", Rule::RedirectsOutput),
    ("-include", Rule::InputPath),
    ("-imacros", Rule::InputPath),
    ("-iquote", Rule::InputPath),
    ("-isystem", Rule::InputPath),
    ("-idirafter", Rule::InputPath),
    ("-iprefix", Rule::InputPath),
    ("-isysroot", Rule::InputPath),
    ("-I", Rule::InputPath),
    ("--sysroot", Rule::InputPath),
];

const SUN_CPP_RULES: RuleTable = &[
    ("-xMD", Rule::InterferesWithDeps),
    ("-xMMD", Rule::InterferesWithDeps),
    ("-xM1", Rule::InterferesWithDeps),
    ("-xMF", Rule::RedirectsOutput),
    ("-xM", Rule::InterferesWithDeps),
    ("-xpch", Rule::Unsupported),
    ("-xprofile", Rule::Unsupported),
    ("-D", Rule::Macro),
    ("-o", Rule::RedirectsOutput),
    ("-include", Rule::InputPath),
    ("-I", Rule::InputPath),
    ("-c", Rule::Compile),
    ("-###", Rule::Unsupported),
];

const AIX_RULES: RuleTable = &[
    ("-qmakedep=gcc", Rule::InterferesWithDeps),
    ("-qmakedep", Rule::InterferesWithDeps),
    ("-qsyntaxonly", Rule::InterferesWithDeps),
    ("-qexpfile", Rule::RedirectsOutput),
    ("-qinclude", Rule::InputPath),
    ("-qcinc", Rule::InputPath),
    ("-qshowpdf", Rule::Unsupported),
    ("-qdump_class_hierachy", Rule::Unsupported),
    ("-MF", Rule::RedirectsOutput),
    ("-M", Rule::InterferesWithDeps),
    ("-D", Rule::Macro),
    ("-o", Rule::RedirectsOutput),
    ("-I", Rule::InputPath),
    ("-c", Rule::Compile),
    ("-#", Rule::Unsupported),
];

/// What the parser learned about one command line.
#[derive(Debug, Default)]
pub struct ParseResult {
    /// True once a `-c` style compile flag was seen.
    pub is_compiler_command: bool,
    /// `-MD`/`-MMD` were present on the original command.
    pub is_md_options: bool,
    /// The dependency output uses the Sun dialect (spaces escaped inside
    /// filenames instead of separating them).
    pub produces_sun_make_rules: bool,
    /// The command cannot be executed remotely.
    pub contains_unsupported_options: bool,
    /// Base name of the compiler, version suffixes stripped.
    pub compiler: String,
    /// Arguments collected inside `-Wp,` / `-Xpreprocessor`.
    pub pre_processor_options: Vec<String>,
    /// The preprocessor-only command used for header discovery.
    pub deps_command: Vec<String>,
    /// Files the command produces.
    pub command_products: BTreeSet<String>,
    /// Dependency files (`-MF` and friends) the command produces.
    pub deps_command_products: BTreeSet<String>,
    /// AIX writes make rules to a file instead of stdout; deleted when the
    /// result is dropped.
    pub aix_deps_file: Option<NamedTempFile>,

    default_deps_command: Vec<String>,
    remaining: VecDeque<String>,
}

/// Converts a command path (`/usr/bin/gcc-4.7`) to a command name (`gcc`),
/// also dropping reentrancy suffixes (`xlc_r` -> `xlc`).
fn command_base_name(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    let bytes = base.as_bytes();
    let mut len = bytes.len();
    if len > 2 && &base[len - 2..] == "_r" {
        len -= 2;
    } else if len > 3 && &base[len - 3..len - 1] == "_r" {
        len -= 3;
    }
    let is_version_char =
        |b: u8| -> bool { b.is_ascii_digit() || b == b'.' || b == b'-' };
    while len > 0 && is_version_char(bytes[len - 1]) {
        len -= 1;
    }
    &base[..len]
}

fn make_result(command: &[String]) -> ParseResult {
    let mut result = ParseResult::default();
    let compiler = match command.first() {
        Some(c) if !c.is_empty() => c,
        _ => return result,
    };
    result.compiler = command_base_name(compiler).to_string();

    if GCC_COMPILERS.contains(&result.compiler.as_str()) {
        result.default_deps_command = GCC_DEFAULT_DEPS.iter().map(|s| s.to_string()).collect();
    } else if SUN_CPP_COMPILERS.contains(&result.compiler.as_str()) {
        result.default_deps_command =
            SUN_CPP_DEFAULT_DEPS.iter().map(|s| s.to_string()).collect();
        result.produces_sun_make_rules = true;
    } else if AIX_COMPILERS.contains(&result.compiler.as_str()) {
        result.default_deps_command = AIX_DEFAULT_DEPS.iter().map(|s| s.to_string()).collect();
        result.produces_sun_make_rules = true;
        match NamedTempFile::new() {
            Ok(file) => {
                result
                    .default_deps_command
                    .push(file.path().to_string_lossy().into_owned());
                result.aix_deps_file = Some(file);
            }
            Err(e) => warn!("failed to create dependency temp file: {}", e),
        }
    }

    result.deps_command.push(compiler.clone());
    result.remaining = command[1..].iter().cloned().collect();
    result
}

fn rules_for_compiler(compiler: &str) -> RuleTable {
    if GCC_COMPILERS.contains(&compiler) {
        GCC_RULES
    } else if SUN_CPP_COMPILERS.contains(&compiler) {
        SUN_CPP_RULES
    } else if AIX_COMPILERS.contains(&compiler) {
        AIX_RULES
    } else if C_COMPILERS.contains(&compiler) || JAVA_COMPILERS.contains(&compiler) {
        // Recognized, but these families carry no option rules; their
        // tokens pass through untouched.
        &[]
    } else {
        // Unknown compiler.
        &[]
    }
}

/// Find the table entry for `option`: exact match first (up to any `=`),
/// then prefix match.
fn match_compiler_option(option: &str, rules: RuleTable) -> Option<(&'static str, Rule)> {
    if !option.starts_with('-') {
        return None;
    }
    let exact: String = option
        .split('=')
        .next()
        .unwrap_or(option)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    for (key, rule) in rules {
        if *key == exact {
            return Some((key, *rule));
        }
    }
    for (key, rule) in rules {
        if option.starts_with(key) {
            return Some((key, *rule));
        }
    }
    None
}

/// Parse a comma separated `-Wp,` list, honoring single quotes.
fn parse_stage_option_list(list: &str, out: &mut Vec<String>) {
    let mut quoted = false;
    let mut current = String::new();
    for character in list.chars() {
        if character == '\'' {
            quoted = !quoted;
        } else if character == ',' && !quoted {
            out.push(std::mem::take(&mut current));
        } else {
            current.push(character);
        }
    }
    out.push(current);
}

impl ParseResult {
    /// Pop the front token, push it onto the deps command if `to_deps`, and
    /// record it as a product when it is an output path.
    fn append_and_remove(
        &mut self,
        is_path: bool,
        to_deps: bool,
        is_output: bool,
        deps_output: bool,
    ) {
        let Some(token) = self.remaining.pop_front() else {
            return;
        };
        if to_deps {
            self.deps_command.push(token.clone());
        }
        if is_path {
            if is_output && !deps_output {
                self.command_products.insert(token);
            } else if is_output {
                self.deps_command_products.insert(token);
            }
        }
    }

    /// Handle an option that may carry its argument attached (`-Ifoo`),
    /// detached (`-I foo`) or behind an equals sign (`--sysroot=foo`).
    fn parse_path_option(
        &mut self,
        option: &str,
        to_deps: bool,
        is_output: bool,
        deps_output: bool,
    ) {
        let detached = match self.remaining.front() {
            Some(front) => front.as_str() == option,
            None => return,
        };
        if detached {
            // Space between option and argument.
            self.append_and_remove(false, to_deps, false, false);
            self.append_and_remove(true, to_deps, is_output, deps_output);
            return;
        }
        let value = self.remaining.pop_front().unwrap_or_default();
        let (modified_option, option_path) = match value.find('=') {
            Some(pos) => (format!("{}=", option), value[pos + 1..].to_string()),
            None => (option.to_string(), value[option.len()..].to_string()),
        };
        if is_output && !deps_output {
            self.command_products.insert(option_path);
        } else if is_output {
            self.deps_command_products.insert(option_path);
        } else if to_deps {
            self.deps_command.push(format!("{}{}", modified_option, option_path));
        }
    }

    fn apply_rule(&mut self, matched: &str, rule: Rule) {
        match rule {
            Rule::InterferesWithDeps => {
                if let Some(front) = self.remaining.front() {
                    if front == "-MMD" || front == "-MD" {
                        self.is_md_options = true;
                    }
                }
                self.remaining.pop_front();
            }
            Rule::InputPath => self.parse_path_option(matched, true, false, false),
            Rule::Compile => {
                self.is_compiler_command = true;
                self.append_and_remove(false, true, false, false);
            }
            Rule::RedirectsOutput => self.parse_path_option(matched, false, true, false),
            Rule::RedirectsDepsOutput => self.parse_path_option(matched, false, true, true),
            Rule::Macro => {
                // -Dname, -Dname=def, -D name, -D name=def.
                let Some(token) = self.remaining.pop_front() else {
                    return;
                };
                self.deps_command.push(token.clone());
                if token == matched {
                    if let Some(arg) = self.remaining.pop_front() {
                        self.deps_command.push(arg);
                    }
                }
            }
            Rule::PreprocessorArg => {
                let Some(value) = self.remaining.pop_front() else {
                    return;
                };
                if matched == "-Wp," {
                    let mut options = Vec::new();
                    parse_stage_option_list(&value[matched.len()..], &mut options);
                    self.pre_processor_options.extend(options);
                } else if matched == "-Xpreprocessor" {
                    if let Some(arg) = self.remaining.pop_front() {
                        self.pre_processor_options.push(arg);
                    }
                }
            }
            Rule::GccLanguage => {
                let Some(token) = self.remaining.pop_front() else {
                    return;
                };
                let language = if token == matched {
                    // Space between -x and argument.
                    match self.remaining.front() {
                        Some(front) => front.clone(),
                        None => {
                            warn!("gcc's \"-x\" flag requires an argument");
                            self.contains_unsupported_options = true;
                            return;
                        }
                    }
                } else {
                    // No space. gcc -x does not understand an equals sign;
                    // "-x=c++" selects the language "=c++".
                    token[matched.len()..].to_string()
                };
                self.remaining.push_front(token);
                if !GCC_SUPPORTED_LANGUAGES.contains(&language.as_str()) {
                    warn!("unsupported language [{}]", language);
                    self.contains_unsupported_options = true;
                }
                self.parse_path_option(matched, true, false, false);
            }
            Rule::Unsupported => {
                self.contains_unsupported_options = true;
                // Stop classifying; keep the remainder on the deps command
                // for diagnostics.
                while let Some(token) = self.remaining.pop_front() {
                    self.deps_command.push(token);
                }
            }
        }
    }

    fn run_rules(&mut self, rules: RuleTable) {
        while let Some(front) = self.remaining.front().cloned() {
            match match_compiler_option(&front, rules) {
                Some((matched, rule)) => self.apply_rule(matched, rule),
                None => {
                    self.remaining.pop_front();
                    self.deps_command.push(front);
                }
            }
        }
    }
}

/// Parse `command` into a [ParseResult].
pub fn parse_command(command: &[String]) -> ParseResult {
    if command.is_empty() {
        return ParseResult::default();
    }
    let mut result = make_result(command);
    if result.compiler.is_empty() {
        return result;
    }

    let rules = rules_for_compiler(&result.compiler);
    result.run_rules(rules);

    if result.contains_unsupported_options {
        result.is_compiler_command = false;
        return result;
    }

    // Expand collected preprocessor options; each surviving argument is
    // re-attached behind its own -Xpreprocessor flag.
    if !result.pre_processor_options.is_empty() {
        let mut preprocess = ParseResult {
            remaining: result.pre_processor_options.iter().cloned().collect(),
            ..Default::default()
        };
        preprocess.run_rules(GCC_PREPROCESSOR_RULES);
        for arg in &preprocess.deps_command {
            result.deps_command.push("-Xpreprocessor".to_string());
            result.deps_command.push(arg.clone());
        }
        result
            .command_products
            .extend(preprocess.command_products.iter().cloned());
        result
            .deps_command_products
            .extend(preprocess.deps_command_products.iter().cloned());
        result.is_md_options = result.is_md_options || preprocess.is_md_options;
    }

    let defaults = std::mem::take(&mut result.default_deps_command);
    result.deps_command.extend(defaults);
    result
}

/// Extract the set of files named after the colon in make-rule output,
/// across line continuations. In the Sun dialect, spaces inside filenames
/// are escaped and an unescaped space is part of the name only while a
/// colon has been seen on the line.
pub fn deps_from_make_rules(rules: &str, is_sun_format: bool) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    let mut saw_colon_on_line = false;
    let mut saw_backslash = false;
    let mut current = String::new();
    for character in rules.chars() {
        if saw_backslash {
            saw_backslash = false;
            if character != '\n' && saw_colon_on_line {
                current.push(character);
            }
        } else if character == '\\' {
            saw_backslash = true;
        } else if character == ':' && !saw_colon_on_line {
            saw_colon_on_line = true;
        } else if character == '\n' {
            saw_colon_on_line = false;
            if !current.is_empty() {
                result.insert(std::mem::take(&mut current));
            }
        } else if character == ' ' {
            if is_sun_format {
                if !current.is_empty() && saw_colon_on_line {
                    current.push(character);
                }
            } else {
                if !current.is_empty() {
                    result.insert(std::mem::take(&mut current));
                }
            }
        } else if saw_colon_on_line {
            current.push(character);
        }
    }
    if !current.is_empty() {
        result.insert(current);
    }
    result
}

/// Run the dependency-discovery command and parse the resulting make rules.
/// A failure to run it is logged and yields the empty set; the action then
/// proceeds without discovered headers.
pub async fn parse_headers(result: &ParseResult) -> BTreeSet<String> {
    let command = result.deps_command.join(" ");
    let output = match tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            warn!("failed to execute dependency command [{}]: {}", command, e);
            return BTreeSet::new();
        }
    };
    if !output.status.success() {
        warn!(
            "dependency command [{}] exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
        return BTreeSet::new();
    }
    let dependencies = match &result.aix_deps_file {
        Some(file) => match tokio::fs::read_to_string(file.path()).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!("failed to read dependency file: {}", e);
                return BTreeSet::new();
            }
        },
        None => String::from_utf8_lossy(&output.stdout).into_owned(),
    };
    deps_from_make_rules(&dependencies, result.produces_sun_make_rules)
}

/// Split an evaluated command line on whitespace.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn args(command: &str) -> Vec<String> {
        split_command(command)
    }

    #[test_case("/usr/bin/gcc-4.7", "gcc")]
    #[test_case("clang-14", "clang")]
    #[test_case("./xlc++_r", "xlc++" ; "xlcxx_r")]
    #[test_case("xlc_r", "xlc")]
    #[test_case("g++", "g++")]
    #[test_case("/opt/bin/CC", "CC")]
    fn base_names(path: &str, expected: &str) {
        assert_eq!(command_base_name(path), expected);
    }

    #[test]
    fn simple_gcc_compile() {
        let result = parse_command(&args("gcc -c hello.c -o hello.o"));
        assert!(result.is_compiler_command);
        assert!(!result.contains_unsupported_options);
        assert_eq!(result.compiler, "gcc");
        assert_eq!(
            result.command_products,
            BTreeSet::from(["hello.o".to_string()])
        );
        assert_eq!(result.deps_command, vec!["gcc", "-c", "hello.c", "-M"]);
    }

    #[test]
    fn attached_output_option() {
        let result = parse_command(&args("gcc -c a.c -oa.o"));
        assert_eq!(result.command_products, BTreeSet::from(["a.o".to_string()]));
    }

    #[test]
    fn dep_flags_are_stripped_and_products_recorded() {
        let result = parse_command(&args("g++ -MD -MF obj/a.o.d -c a.cc -o obj/a.o"));
        assert!(result.is_compiler_command);
        assert!(result.is_md_options);
        assert_eq!(
            result.deps_command_products,
            BTreeSet::from(["obj/a.o.d".to_string()])
        );
        // Neither -MD nor -MF survive into the dependency command.
        assert_eq!(result.deps_command, vec!["g++", "-c", "a.cc", "-M"]);
    }

    #[test]
    fn include_paths_are_kept_for_the_deps_command() {
        let result = parse_command(&args("gcc -I include -Iother -c a.c -o a.o"));
        assert_eq!(
            result.deps_command,
            vec!["gcc", "-I", "include", "-Iother", "-c", "a.c", "-M"]
        );
    }

    #[test]
    fn sysroot_with_equals() {
        let result = parse_command(&args("gcc --sysroot=/opt/root -c a.c -o a.o"));
        assert!(result
            .deps_command
            .contains(&"--sysroot=/opt/root".to_string()));
    }

    #[test]
    fn macros_detached_and_attached() {
        let result = parse_command(&args("gcc -DFOO -D BAR=1 -c a.c -o a.o"));
        assert_eq!(
            result.deps_command,
            vec!["gcc", "-DFOO", "-D", "BAR=1", "-c", "a.c", "-M"]
        );
    }

    #[test]
    fn preprocessor_lists_are_expanded() {
        let result = parse_command(&args("gcc -Wp,-MD,obj/x.d -c x.c -o x.o"));
        assert!(result.is_md_options);
        let deps = result.deps_command.join(" ");
        assert!(deps.contains("-Xpreprocessor obj/x.d"));
        assert!(!deps.contains("-Wp,"));
    }

    #[test]
    fn xpreprocessor_pairs_are_collected() {
        let result = parse_command(&args("gcc -Xpreprocessor -MP -c a.c -o a.o"));
        // -MP interferes with deps and is dropped in the preprocessor pass.
        assert!(!result.deps_command.join(" ").contains("-MP"));
    }

    #[test]
    fn unsupported_language_is_rejected() {
        let result = parse_command(&args("gcc -x assembler -c a.S -o a.o"));
        assert!(result.contains_unsupported_options);
        assert!(!result.is_compiler_command);
    }

    #[test]
    fn supported_language_passes() {
        let result = parse_command(&args("gcc -x c++ -c a.cc -o a.o"));
        assert!(!result.contains_unsupported_options);
        assert!(result.is_compiler_command);
        assert!(result.deps_command.join(" ").contains("-x c++"));
    }

    #[test]
    fn sun_cc_uses_xm_and_sun_rules() {
        let result = parse_command(&args("CC -c x.cc -o x.o"));
        assert!(result.is_compiler_command);
        assert!(result.produces_sun_make_rules);
        assert_eq!(result.deps_command.last().unwrap(), "-xM");
    }

    #[test]
    fn sun_pch_is_unsupported() {
        let result = parse_command(&args("CC -xpch=auto -c x.cc"));
        assert!(result.contains_unsupported_options);
        assert!(!result.is_compiler_command);
    }

    #[test]
    fn aix_gets_a_scoped_deps_file() {
        let result = parse_command(&args("xlc_r -c x.c -o x.o"));
        assert!(result.is_compiler_command);
        assert!(result.produces_sun_make_rules);
        assert_eq!(result.compiler, "xlc");
        let file = result.aix_deps_file.as_ref().expect("aix temp file");
        let path = file.path().to_path_buf();
        assert!(path.exists());
        let deps = result.deps_command.join(" ");
        assert!(deps.contains("-qsyntaxonly -M -MF"));
        assert!(deps.ends_with(&path.to_string_lossy().into_owned()));
        drop(result);
        assert!(!path.exists(), "temp file must be released on drop");
    }

    #[test]
    fn unknown_compiler_is_not_a_compile_command() {
        let result = parse_command(&args("ld -o prog a.o b.o"));
        assert!(!result.is_compiler_command);
        assert!(result.command_products.is_empty());
    }

    #[test]
    fn plain_cc_has_no_rules() {
        let result = parse_command(&args("cc -c a.c -o a.o"));
        // cc carries no option table, so -c is never classified.
        assert!(!result.is_compiler_command);
    }

    #[test]
    fn java_compilers_pass_their_tokens_through() {
        let result = parse_command(&args("javac -d out Main.java"));
        assert_eq!(result.compiler, "javac");
        assert!(!result.is_compiler_command);
        assert_eq!(result.deps_command, vec!["javac", "-d", "out", "Main.java"]);
    }

    #[test]
    fn empty_command() {
        let result = parse_command(&[]);
        assert!(!result.is_compiler_command);
        assert!(result.compiler.is_empty());
    }

    #[test]
    fn make_rules_basic() {
        let deps = deps_from_make_rules("a.o: a.c b.h c.h\n", false);
        assert_eq!(
            deps,
            BTreeSet::from(["a.c".to_string(), "b.h".to_string(), "c.h".to_string()])
        );
    }

    #[test]
    fn make_rules_line_continuations() {
        let deps = deps_from_make_rules("a.o: a.c \\\n  b.h \\\n  c.h\n", false);
        assert_eq!(
            deps,
            BTreeSet::from(["a.c".to_string(), "b.h".to_string(), "c.h".to_string()])
        );
    }

    #[test]
    fn make_rules_multiple_targets() {
        let deps = deps_from_make_rules("a.o: a.c\nb.o: b.c h.h\n", false);
        assert_eq!(
            deps,
            BTreeSet::from(["a.c".to_string(), "b.c".to_string(), "h.h".to_string()])
        );
    }

    #[test]
    fn sun_dialect_keeps_spaces_in_names() {
        let deps = deps_from_make_rules("a.o: dir/my\\ file.h\n", true);
        assert_eq!(deps, BTreeSet::from(["dir/my file.h".to_string()]));
    }

    #[test]
    fn stage_option_list_honors_quotes() {
        let mut out = Vec::new();
        parse_stage_option_list("-MD,'a,b.d',-MP", &mut out);
        assert_eq!(out, vec!["-MD", "a,b.d", "-MP"]);
    }
}
