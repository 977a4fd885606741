//! Task inspection commands, read from the store snapshot.

use crate::common::{self, GlobalOpts};
use crate::output;
use anyhow::Result;
use clap::Args;
use eth_worker::{TaskStatus, TaskView};
use uuid::Uuid;

/// Task inspection commands.
#[derive(clap::Subcommand, Debug)]
pub enum TaskCommand {
    /// Show a task with its attempts
    Get(GetArgs),
    /// List tasks in an id range with their status
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Task uuid
    uuid: Uuid,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    min_id: Option<u64>,

    #[arg(long)]
    max_id: Option<u64>,

    /// Only list FAILED tasks
    #[arg(long, default_value_t = false)]
    failed: bool,
}

impl TaskCommand {
    pub fn run(&self, global: &GlobalOpts) -> Result<()> {
        match self {
            TaskCommand::Get(args) => cmd_get(args, global),
            TaskCommand::List(args) => cmd_list(args, global),
        }
    }
}

fn cmd_get(args: &GetArgs, global: &GlobalOpts) -> Result<()> {
    let config = global.load_config()?;
    let (store, _) = common::open_snapshot(&config)?;
    let task = store.task_by_uuid(&args.uuid)?;
    let view = TaskView::build(&store, &task)?;

    if global.json {
        return output::print_json(&view);
    }
    output::print_header(&format!("Task {}", view.uuid));
    output::print_kv("Type", &view.task_type);
    output::print_kv("Status", view.status.as_str());
    output::print_kv("Invocations", &(view.previous_invocations + 1).to_string());
    if let Some(hash) = view.successful_hash {
        output::print_kv("Hash", &hash.to_string());
    }
    if let Some(block) = view.successful_block {
        output::print_kv("Block", &block.to_string());
    }
    for txn in &view.transactions {
        output::print_kv(
            &format!("Attempt {}", txn.id),
            &format!(
                "{} nonce={:?} {}",
                txn.status,
                txn.nonce,
                txn.message.as_deref().unwrap_or_default()
            ),
        );
    }
    Ok(())
}

fn cmd_list(args: &ListArgs, global: &GlobalOpts) -> Result<()> {
    let config = global.load_config()?;
    let (store, _) = common::open_snapshot(&config)?;
    let statuses: &[TaskStatus] = if args.failed {
        &[TaskStatus::Failed]
    } else {
        &[
            TaskStatus::Success,
            TaskStatus::Pending,
            TaskStatus::Unstarted,
            TaskStatus::Failed,
            TaskStatus::Unknown,
        ]
    };

    let mut rows = Vec::new();
    for task in store.tasks_in_range(args.min_id, args.max_id, statuses) {
        rows.push((task.id, task.uuid, store.task_status(task.id)?));
    }

    if global.json {
        let rows: Vec<_> = rows
            .iter()
            .map(|(id, uuid, status)| serde_json::json!({"id": id, "uuid": uuid, "status": status}))
            .collect();
        return output::print_json(&rows);
    }
    output::print_header("Tasks");
    for (id, uuid, status) in rows {
        output::print_kv(&id.to_string(), &format!("{uuid} {status}"));
    }
    Ok(())
}
