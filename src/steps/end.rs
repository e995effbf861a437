//! Terminal step.
//!
//! Settings:
//! - `endremove`: non-empty removes the item from workflow containment
//! - `endsetupdatetime`: non-empty sets `updatetime` to now when it is empty
//!   or lies in the past
//! - `endtext`: text shown when the item is visited in this step

use chrono::{Local, NaiveDateTime};
use log::{debug, info};

use crate::execution::behavior::{default_render, BehaviorError, StepBehavior, StepContext};
use crate::execution::engine::TIME_FORMAT;
use crate::execution::page::{Page, Request};
use crate::workflow::Step;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndStep {
    pub remove: bool,
    pub set_update_time: bool,
    pub text: String,
}

impl EndStep {
    pub fn from_step(step: &Step) -> Self {
        Self {
            remove: !step.setting("endremove").is_empty(),
            set_update_time: !step.setting("endsetupdatetime").is_empty(),
            text: step.setting("endtext").to_string(),
        }
    }
}

/// True when `value` is empty, unparsable or earlier than `now`.
fn is_stale(value: &str, now: NaiveDateTime) -> bool {
    match NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT) {
        Ok(time) => time < now,
        Err(_) => true,
    }
}

impl StepBehavior for EndStep {
    fn run_action(&self, ctx: &mut StepContext<'_>, _outcome: bool) -> Result<(), BehaviorError> {
        if self.set_update_time {
            let now = Local::now().naive_local();
            if is_stale(&ctx.get("updatetime")?, now) {
                ctx.set("updatetime", &now.format(TIME_FORMAT).to_string())?;
                debug!("Set updatetime of item {}", ctx.item());
            }
        }

        if self.remove {
            ctx.leave_workflow()?;
            info!(
                "Item {} finished workflow '{}' and left it",
                ctx.item(),
                ctx.workflow().name
            );
        }

        ctx.commit()
    }

    fn render(&self, ctx: &mut StepContext<'_>, request: &Request) -> Result<Page, BehaviorError> {
        if self.text.is_empty() {
            return default_render(self, ctx, request);
        }
        Ok(Page::Text {
            item: ctx.item(),
            text: self.text.clone(),
        })
    }
}
