//! `platval list` command handler

use std::io::Write;

use clap::{Arg, ArgAction};
use serde::Serialize;

use platval_core::testcase::{TestCaseInfo, TestRegistry};

use crate::cli::ListArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

pub fn execute(args: ListArgs, registry: &TestRegistry, writer: &OutputWriter) -> Result<(), CliError> {
    let report = CaseList::collect(registry, args.tag.as_deref(), args.verbose);
    writer.render(&report)
}

#[derive(Serialize)]
pub struct CaseEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub supported_os: Vec<String>,
    pub args: Vec<ArgEntry>,
}

#[derive(Serialize)]
pub struct ArgEntry {
    pub name: String,
    pub help: String,
    pub required: bool,
    pub flag: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ArgEntry {
    fn from_arg(arg: &Arg) -> Self {
        let default = arg
            .get_default_values()
            .iter()
            .map(|v| v.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        let flag = matches!(arg.get_action(), ArgAction::SetTrue);
        Self {
            name: arg.get_long().unwrap_or(arg.get_id().as_str()).to_owned(),
            help: arg.get_help().map(ToString::to_string).unwrap_or_default(),
            required: arg.is_required_set(),
            flag,
            default: (!flag && !default.is_empty()).then(|| default.join(",")),
        }
    }
}

impl CaseEntry {
    fn from_info(registry: &TestRegistry, info: &TestCaseInfo) -> Self {
        let args = registry
            .usage(info.id)
            .map(|usage| {
                usage
                    .get_arguments()
                    .filter(|a| !matches!(a.get_id().as_str(), "help" | "version"))
                    .map(ArgEntry::from_arg)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: info.id.to_owned(),
            name: info.name.to_owned(),
            description: info.description.to_owned(),
            tags: info.tags.iter().map(|t| (*t).to_owned()).collect(),
            supported_os: info.supported_os.iter().map(ToString::to_string).collect(),
            args,
        }
    }
}

#[derive(Serialize)]
pub struct CaseList {
    pub cases: Vec<CaseEntry>,
    #[serde(skip)]
    pub verbose: bool,
}

impl CaseList {
    pub fn collect(registry: &TestRegistry, tag: Option<&str>, verbose: bool) -> Self {
        let cases = registry
            .list()
            .into_iter()
            .filter(|info| tag.is_none_or(|t| info.tags.contains(&t)))
            .map(|info| CaseEntry::from_info(registry, info))
            .collect();
        Self { cases, verbose }
    }
}

impl Render for CaseList {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "{:<24} {:<18} {}", "ID".bold(), "OS".bold(), "NAME".bold())?;
        writeln!(w, "{}", "-".repeat(72))?;
        for case in &self.cases {
            writeln!(
                w,
                "{:<24} {:<18} {}",
                case.id.cyan(),
                case.supported_os.join(","),
                case.name
            )?;
            if self.verbose {
                writeln!(w, "    {}", case.description.dimmed())?;
                for arg in &case.args {
                    let marker = match (arg.required, arg.flag) {
                        (true, _) => " (required)",
                        (false, true) => " (flag)",
                        (false, false) => "",
                    };
                    match &arg.default {
                        Some(default) => {
                            writeln!(w, "    --{}{marker}: {} [default: {default}]", arg.name, arg.help)?
                        }
                        None => writeln!(w, "    --{}{marker}: {}", arg.name, arg.help)?,
                    }
                }
            }
        }
        writeln!(w)?;
        writeln!(w, "{} test case(s)", self.cases.len())
    }
}
