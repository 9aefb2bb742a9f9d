//! The dispatcher state machine.
//!
//! The dispatcher owns the step list, the current position and direction,
//! and the skip list. It never reorders steps. Moving back below the first
//! step is refused with [`DispatchError::OutOfBounds`]; callers check
//! [`Dispatcher::can_go_back`] first.

use super::step::Step;
use super::{DispatchError, Direction, SkipState};
use crate::presentation::Presentation;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Where [`Dispatcher::dispatch`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An indirect step waits for the presentation layer.
    Waiting(String),
    /// The last step was left.
    Finished,
}

pub struct Dispatcher<C> {
    steps: Vec<Step<C>>,
    /// `None` before the first move, `steps.len()` after the last.
    position: Option<usize>,
    direction: Direction,
    first_step: usize,
    skip_steps: HashMap<String, SkipState>,
    done_steps: Vec<String>,
    context: C,
    presentation: Arc<dyn Presentation>,
}

impl<C> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("steps", &self.steps)
            .field("current", &self.current_step())
            .field("direction", &self.direction)
            .field("first_step", &self.first_step)
            .field("skip_steps", &self.skip_steps)
            .finish()
    }
}

impl<C> Dispatcher<C> {
    pub fn new(steps: Vec<Step<C>>, context: C, presentation: Arc<dyn Presentation>) -> Self {
        Self {
            steps,
            position: None,
            direction: Direction::Forward,
            first_step: 0,
            skip_steps: HashMap::new(),
            done_steps: Vec::new(),
            context,
            presentation,
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn into_context(self) -> C {
        self.context
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn steps(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(Step::name)
    }

    fn index_of(&self, name: &str) -> Result<usize, DispatchError> {
        self.steps
            .iter()
            .position(|step| step.name() == name)
            .ok_or_else(|| DispatchError::UnknownStep(name.to_string()))
    }

    /// Name of the step the dispatcher stands on. `None` before the first
    /// move and after the last step.
    pub fn current_step(&self) -> Option<&str> {
        self.position
            .and_then(|i| self.steps.get(i))
            .map(Step::name)
    }

    pub fn is_finished(&self) -> bool {
        self.position == Some(self.steps.len())
    }

    /// Steps left forward so far, each listed once.
    pub fn done_steps(&self) -> &[String] {
        &self.done_steps
    }

    /// Start the walk at `name` instead of the first step.
    pub fn set_first_step(&mut self, name: &str) -> Result<(), DispatchError> {
        self.first_step = self.index_of(name)?;
        Ok(())
    }

    pub fn skip_state(&self, name: &str) -> SkipState {
        self.skip_steps
            .get(name)
            .copied()
            .unwrap_or(SkipState::NotSkipped)
    }

    pub fn step_in_skip_list(&self, name: &str) -> bool {
        self.skip_steps.contains_key(name)
    }

    /// Skip or unskip `name`. A permanent skip cannot be undone.
    pub fn skip_step(&mut self, name: &str, skip: bool, permanent: bool) -> Result<(), DispatchError> {
        self.index_of(name)?;
        let current = self.skip_state(name);

        if skip {
            if permanent {
                self.skip_steps
                    .insert(name.to_string(), SkipState::SkippedPermanent);
            } else if current == SkipState::NotSkipped {
                self.skip_steps
                    .insert(name.to_string(), SkipState::SkippedTransient);
            }
        } else if current == SkipState::SkippedTransient {
            self.skip_steps.remove(name);
        } else if current == SkipState::SkippedPermanent {
            debug!("Step {} stays skipped permanently", name);
        }
        Ok(())
    }

    /// Limit the walk to `names`. Transient skips are dropped first, then
    /// every step not named is skipped transiently. Unknown names are
    /// logged and ignored.
    pub fn set_step_list<S: AsRef<str>>(&mut self, names: &[S]) {
        self.skip_steps
            .retain(|_, state| *state == SkipState::SkippedPermanent);

        for step in &self.steps {
            if !names.iter().any(|name| name.as_ref() == step.name()) {
                self.skip_steps
                    .entry(step.name().to_string())
                    .or_insert(SkipState::SkippedTransient);
            }
        }
        for name in names {
            if !self.steps.iter().any(|step| step.name() == name.as_ref()) {
                warn!("Step {} does not exist", name.as_ref());
            }
        }
    }

    fn is_skipped(&self, index: usize) -> bool {
        self.steps
            .get(index)
            .is_some_and(|step| self.step_in_skip_list(step.name()))
    }

    /// True when some step between the first step and the current one is
    /// shown by the presentation layer and not skipped.
    pub fn can_go_back(&self) -> bool {
        let Some(current) = self.position else {
            return false;
        };
        (self.first_step..current.min(self.steps.len()))
            .any(|i| !self.steps[i].is_direct() && !self.is_skipped(i))
    }

    pub fn go_next(&mut self) -> Result<(), DispatchError> {
        self.direction = Direction::Forward;
        self.move_step()
    }

    pub fn go_prev(&mut self) -> Result<(), DispatchError> {
        self.direction = Direction::Back;
        self.move_step()
    }

    fn mark_done(&mut self, index: usize) {
        let name = self.steps[index].name();
        if !self.done_steps.iter().any(|done| done == name) {
            self.done_steps.push(name.to_string());
        }
    }

    fn leave(&mut self, index: usize) {
        info!("leaving ({}) step {}", self.direction, self.steps[index].name());
        if self.direction == Direction::Forward {
            self.mark_done(index);
        }
    }

    /// Move one step in the current direction, then keep moving over
    /// skipped steps and direct steps, running the latter, until an
    /// indirect step or the end of the list is reached.
    fn move_step(&mut self) -> Result<(), DispatchError> {
        let len = self.steps.len() as isize;
        let mut index = match self.position {
            None => self.first_step as isize,
            Some(current) if (current as isize) < len => {
                self.leave(current);
                current as isize + self.direction.offset()
            }
            Some(current) => current as isize + self.direction.offset().min(0),
        };

        loop {
            if index >= len {
                self.position = Some(self.steps.len());
                return Ok(());
            }
            if index < self.first_step as isize {
                return Err(DispatchError::OutOfBounds {
                    index,
                    first_step: self.first_step,
                });
            }

            let current = index as usize;
            if self.is_skipped(current) {
                index += self.direction.offset();
                continue;
            }

            self.position = Some(current);
            let name = self.steps[current].name().to_string();
            info!("moving ({}) to step {}", self.direction, name);

            let Some(action) = self.steps[current].action() else {
                return Ok(());
            };
            debug!("{} is a direct step", name);
            match action(&mut self.context)? {
                Direction::Default => {}
                direction => self.direction = direction,
            }
            self.leave(current);
            index += self.direction.offset();
        }
    }

    /// Move on to the next indirect step, or finish. After the last step the
    /// presentation layer is shut down.
    pub fn dispatch(&mut self) -> Result<DispatchOutcome, DispatchError> {
        self.move_step()?;
        match self.current_step() {
            Some(name) => Ok(DispatchOutcome::Waiting(name.to_string())),
            None => {
                self.presentation.shutdown();
                Ok(DispatchOutcome::Finished)
            }
        }
    }

    /// Walk the whole list, showing each indirect step through the
    /// presentation layer and following the direction it returns.
    pub fn run(&mut self) -> Result<(), DispatchError> {
        self.direction = Direction::Forward;
        loop {
            let name = match self.dispatch()? {
                DispatchOutcome::Finished => return Ok(()),
                DispatchOutcome::Waiting(name) => name,
            };

            let mut direction = self.presentation.display_step(&name);
            while direction == Direction::Back && !self.can_go_back() {
                warn!("Cannot go back from step {}", name);
                direction = self.presentation.display_step(&name);
            }
            self.direction = match direction {
                Direction::Back => Direction::Back,
                Direction::Forward | Direction::Default => Direction::Forward,
            };
        }
    }
}
