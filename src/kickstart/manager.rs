//! Kickstart distribution
//!
//! The manager splits a kickstart, gives every module the elements it
//! claims and maps the line numbers of the module reports back to the
//! files and lines the elements came from.

use super::element::{
    get_kickstart_from_elements, get_references_from_elements, KickstartElements, Selection,
};
use super::parser::{KickstartError, SplitKickstartParser};
use super::report::{KickstartMessage, KickstartReport};
use crate::bus::BusError;
use crate::modules::{KickstartModuleProxy, ModuleManager, ModuleObserver};
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
pub struct KickstartManager {
    modules: Arc<ModuleManager>,
    valid_sections: Vec<String>,
    missing_include_is_fatal: bool,
}

impl KickstartManager {
    pub fn new<S: AsRef<str>>(modules: Arc<ModuleManager>, valid_sections: &[S]) -> Self {
        Self {
            modules,
            valid_sections: valid_sections.iter().map(|s| s.as_ref().to_string()).collect(),
            missing_include_is_fatal: false,
        }
    }

    pub fn with_fatal_includes(mut self, fatal: bool) -> Self {
        self.missing_include_is_fatal = fatal;
        self
    }

    fn parser(&self) -> SplitKickstartParser {
        SplitKickstartParser::new(&self.valid_sections, self.missing_include_is_fatal)
    }

    /// Split and distribute the kickstart file at `path`.
    pub fn read_kickstart_file(&self, path: &Path) -> KickstartReport {
        info!("Reading kickstart file {}", path.display());
        let mut parser = self.parser();
        let result = parser.split(path);
        self.process(result, parser.errors())
    }

    /// Split and distribute kickstart text named `filename`.
    pub fn read_kickstart(&self, text: &str, filename: &str) -> KickstartReport {
        let mut parser = self.parser();
        let result = parser.split_from_string(text, filename);
        self.process(result, parser.errors())
    }

    fn process(
        &self,
        result: Result<KickstartElements, KickstartError>,
        soft_errors: &[KickstartError],
    ) -> KickstartReport {
        let mut report = KickstartReport::new();
        for e in soft_errors {
            report.add_error(split_error(e));
        }

        let mut elements = match result {
            Ok(elements) => elements,
            Err(e) => {
                error!("The kickstart cannot be split: {}", e);
                report.add_error(split_error(&e));
                return report;
            }
        };

        for observer in self.modules.get_available_observers() {
            if let Err(e) = distribute(&observer, &mut elements, &mut report) {
                error!("Failed to hand the kickstart to {}: {}", observer.service_name(), e);
                report.add_error(KickstartMessage::new(
                    observer.service_name(),
                    "",
                    0,
                    e.to_string(),
                ));
            }
        }

        for element in elements.unprocessed_elements() {
            warn!(
                "No module handles {} {} at {}:{}",
                element.kind(),
                element.name(),
                element.filename(),
                element.lineno()
            );
        }
        report
    }

    /// The kickstart of every module, ordered by module name and separated
    /// by blank lines.
    pub fn generate_kickstart(&self) -> Result<String, BusError> {
        let mut parts = Vec::new();
        for observer in self.modules.get_available_observers() {
            let text = observer.kickstart()?.generate_kickstart()?;
            parts.push((observer.service_name().to_string(), text));
        }
        parts.sort_by(|a, b| a.0.cmp(&b.0));

        let sections: Vec<&str> = parts
            .iter()
            .map(|(_, text)| text.trim())
            .filter(|text| !text.is_empty())
            .collect();
        Ok(sections.join("\n\n"))
    }
}

fn split_error(e: &KickstartError) -> KickstartMessage {
    KickstartMessage::new("", e.filename(), e.lineno(), e.to_string())
}

fn distribute(
    observer: &ModuleObserver,
    elements: &mut KickstartElements,
    report: &mut KickstartReport,
) -> Result<(), BusError> {
    let module = observer.kickstart()?;
    let (commands, sections, addons) = ownership(&module)?;
    let selected =
        elements.get_and_process_elements(Selection::new(&commands, &sections, &addons));
    let text = get_kickstart_from_elements(&selected);
    let references = get_references_from_elements(&selected);

    debug!(
        "Sending {} element(s) to {}",
        selected.len(),
        observer.service_name()
    );
    let module_report = module.read_kickstart(&text)?;

    let locate = |message: KickstartMessage| {
        let reference = references
            .get(message.line_number as usize)
            .cloned()
            .unwrap_or_default();
        KickstartMessage::new(
            observer.service_name(),
            reference.filename,
            reference.lineno,
            message.message,
        )
    };
    for message in module_report.error_messages {
        report.add_error(locate(message));
    }
    for message in module_report.warning_messages {
        report.add_warning(locate(message));
    }
    Ok(())
}

fn ownership(
    module: &KickstartModuleProxy,
) -> Result<(Vec<String>, Vec<String>, Vec<String>), BusError> {
    Ok((
        module.kickstart_commands()?,
        module.kickstart_sections()?,
        module.kickstart_addons()?,
    ))
}
