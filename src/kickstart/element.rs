//! Kickstart elements and the tracked element collection.
//!
//! An element is one command, section or addon of a split kickstart together
//! with the file and line it came from. The collection hands elements out to
//! modules and remembers which ones were already handed out.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashSet;
use strum::{Display, EnumString};

/// Closing marker of sections and addons.
pub const END_MARKER: &str = "%end";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Command,
    Section,
    Addon,
}

/// One command, section or addon with its source coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickstartElement {
    kind: ElementKind,
    name: String,
    args: Vec<String>,
    lines: Vec<String>,
    lineno: u32,
    filename: String,
    /// The command line exactly as written.
    source: String,
}

impl KickstartElement {
    /// A command from its source line.
    pub fn command(line: &str, lineno: u32, filename: &str) -> Self {
        let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        Self {
            kind: ElementKind::Command,
            name: args.first().cloned().unwrap_or_default(),
            args,
            lines: Vec::new(),
            lineno,
            filename: filename.to_string(),
            source: line.to_string(),
        }
    }

    /// A section from its header tokens (marker included) and body.
    pub fn section(args: Vec<String>, lines: Vec<String>, lineno: u32, filename: &str) -> Self {
        let name = args
            .first()
            .map(|header| header.trim_start_matches('%').to_string())
            .unwrap_or_default();
        Self::block(ElementKind::Section, name, args, lines, lineno, filename)
    }

    /// An addon from its header tokens (`%addon <name> ...`) and body.
    pub fn addon(args: Vec<String>, lines: Vec<String>, lineno: u32, filename: &str) -> Self {
        let name = args.get(1).cloned().unwrap_or_default();
        Self::block(ElementKind::Addon, name, args, lines, lineno, filename)
    }

    fn block(
        kind: ElementKind,
        name: String,
        args: Vec<String>,
        lines: Vec<String>,
        lineno: u32,
        filename: &str,
    ) -> Self {
        Self {
            kind,
            name,
            source: args.join(" "),
            args,
            lines,
            lineno,
            filename: filename.to_string(),
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Body lines of a section or addon, without newlines.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Line of the command or of the section header.
    pub fn lineno(&self) -> u32 {
        self.lineno
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_command(&self) -> bool {
        self.kind == ElementKind::Command
    }

    /// The canonical text of the element, always ending with a newline.
    pub fn content(&self) -> String {
        match self.kind {
            ElementKind::Command => format!("{}\n", self.source),
            ElementKind::Section | ElementKind::Addon => {
                let mut content = format!("{}\n", self.args.join(" "));
                for line in &self.lines {
                    content.push_str(line);
                    content.push('\n');
                }
                content.push_str(END_MARKER);
                content.push('\n');
                content
            }
        }
    }

    /// Number of lines of [`KickstartElement::content`].
    pub fn line_count(&self) -> usize {
        match self.kind {
            ElementKind::Command => 1,
            ElementKind::Section | ElementKind::Addon => self.lines.len() + 2,
        }
    }

    fn matches(&self, selection: &Selection<'_>) -> bool {
        let names = match self.kind {
            ElementKind::Command => selection.commands,
            ElementKind::Section => selection.sections,
            ElementKind::Addon => selection.addons,
        };
        names
            .iter()
            .any(|name| name.trim_start_matches('%') == self.name)
    }
}

/// Names of the commands, sections and addons a module owns.
///
/// Section names may be given with or without the `%` marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selection<'a> {
    pub commands: &'a [String],
    pub sections: &'a [String],
    pub addons: &'a [String],
}

impl<'a> Selection<'a> {
    pub fn new(commands: &'a [String], sections: &'a [String], addons: &'a [String]) -> Self {
        Self {
            commands,
            sections,
            addons,
        }
    }
}

/// Source coordinates of one rendered line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineReference {
    pub lineno: u32,
    pub filename: String,
}

/// Elements of a split kickstart, in source order, with the set of elements
/// already handed out.
#[derive(Debug, Clone, Default)]
pub struct KickstartElements {
    elements: Vec<KickstartElement>,
    processed: HashSet<usize>,
}

impl KickstartElements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, element: KickstartElement) {
        self.elements.push(element);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn all_elements(&self) -> &[KickstartElement] {
        &self.elements
    }

    pub fn is_processed(&self, index: usize) -> bool {
        self.processed.contains(&index)
    }

    /// Elements matching the selection, processed or not.
    pub fn get_elements(&self, selection: Selection<'_>) -> Vec<&KickstartElement> {
        self.elements
            .iter()
            .filter(|element| element.matches(&selection))
            .collect()
    }

    /// Take the unprocessed elements matching the selection and mark them
    /// processed.
    pub fn get_and_process_elements(&mut self, selection: Selection<'_>) -> Vec<KickstartElement> {
        let mut taken = Vec::new();
        for (index, element) in self.elements.iter().enumerate() {
            if !self.processed.contains(&index) && element.matches(&selection) {
                self.processed.insert(index);
                taken.push(element.clone());
            }
        }
        taken
    }

    pub fn unprocessed_elements(&self) -> Vec<&KickstartElement> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.processed.contains(index))
            .map(|(_, element)| element)
            .collect()
    }

    pub fn processed_elements(&self) -> Vec<&KickstartElement> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(index, _)| self.processed.contains(index))
            .map(|(_, element)| element)
            .collect()
    }
}

/// Render elements back into kickstart text.
pub fn get_kickstart_from_elements<E: Borrow<KickstartElement>>(elements: &[E]) -> String {
    elements
        .iter()
        .map(|element| element.borrow().content())
        .collect()
}

/// Map every line of the rendered elements to its source coordinates.
///
/// Index 0 is the sentinel `(0, "")`, so the table is indexed by 1-based
/// line numbers of the rendered text. Lines of a section or addon map to the
/// header line plus their offset inside the rendered block.
pub fn get_references_from_elements<E: Borrow<KickstartElement>>(
    elements: &[E],
) -> Vec<LineReference> {
    let mut references = vec![LineReference::default()];
    for element in elements {
        let element = element.borrow();
        for offset in 0..element.line_count() {
            references.push(LineReference {
                lineno: element.lineno + offset as u32,
                filename: element.filename.clone(),
            });
        }
    }
    references
}
