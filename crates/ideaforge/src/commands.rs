//! Subcommand dispatch. Every command returns the JSON it prints.

use miette::Result;
use serde::Serialize;
use serde_json::{Value, json};

use ideaforge_engine::{EngineError, NewIdea, NewPledge};

use crate::app::App;
use crate::{CommentCommand, Commands, IdeaCommand};

fn report(e: EngineError) -> miette::Report {
    miette::miette!("{}", e)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| miette::miette!("{}", e))
}

pub async fn run(app: &App, command: Commands) -> Result<Value> {
    match command {
        Commands::Idea { command } => run_idea(app, command).await,

        Commands::Vote { idea_id, direction } => {
            let outcome = app
                .coordinator
                .vote(&idea_id, direction)
                .await
                .map_err(report)?;
            to_json(&outcome)
        }

        Commands::Fork { idea_id, key } => {
            let coordinator = &app.coordinator;
            if coordinator.idea_view(&idea_id).is_none() {
                coordinator.load_idea(&idea_id).await.map_err(report)?;
            }
            let pending = match key {
                Some(key) => coordinator.begin_fork_with_key(&idea_id, key),
                None => coordinator.begin_fork(&idea_id),
            }
            .map_err(report)?;

            match pending.commit().await {
                Ok(outcome) => to_json(&outcome),
                Err(failure) => {
                    let key = failure.rollback.fork_key().map(str::to_string);
                    coordinator
                        .rollback(failure.rollback)
                        .await
                        .map_err(report)?;
                    Err(miette::miette!(
                        help = format!(
                            "retry with --key {} to avoid counting the fork twice",
                            key.unwrap_or_default()
                        ),
                        "fork failed: {}",
                        failure.error
                    ))
                }
            }
        }

        Commands::Comment { command } => run_comment(app, command).await,

        Commands::Notifications => {
            let notifications = app
                .backend()
                .notifications(&app.actor().id)
                .await
                .map_err(report)?;
            to_json(&notifications)
        }

        Commands::Read { notification_id } => {
            let notification = app
                .backend()
                .mark_notification_read(app.actor(), &notification_id)
                .await
                .map_err(report)?;
            to_json(&notification)
        }

        Commands::Profile => {
            let profile = app.coordinator.load_profile().await.map_err(report)?;
            to_json(&profile)
        }

        Commands::Pledge {
            idea_id,
            kind,
            description,
            amount,
        } => {
            let pledge = app
                .backend()
                .pledge_resource(
                    app.actor(),
                    &idea_id,
                    NewPledge {
                        kind,
                        description,
                        amount,
                    },
                )
                .await
                .map_err(report)?;
            to_json(&pledge)
        }

        Commands::Pledges { idea_id } => {
            let pledges = app.backend().list_pledges(&idea_id).await.map_err(report)?;
            to_json(&pledges)
        }

        Commands::Apply {
            idea_id,
            role,
            message,
        } => {
            let application = app
                .backend()
                .apply_for_role(app.actor(), &idea_id, &role, &message)
                .await
                .map_err(report)?;
            to_json(&application)
        }

        Commands::Applications { idea_id } => {
            let applications = app
                .backend()
                .list_applications(&idea_id)
                .await
                .map_err(report)?;
            to_json(&applications)
        }

        Commands::Decide {
            application_id,
            reject,
        } => {
            let application = app
                .backend()
                .decide_application(app.actor(), &application_id, !reject)
                .await
                .map_err(report)?;
            to_json(&application)
        }
    }
}

async fn run_idea(app: &App, command: IdeaCommand) -> Result<Value> {
    match command {
        IdeaCommand::Create { title, body } => {
            let view = app
                .coordinator
                .create_idea(NewIdea { title, body })
                .await
                .map_err(report)?;
            to_json(&view)
        }
        IdeaCommand::List { limit } => {
            let views = app.coordinator.load_ideas(limit).await.map_err(report)?;
            to_json(&views)
        }
        IdeaCommand::Show { idea_id } => {
            let view = app.coordinator.load_idea(&idea_id).await.map_err(report)?;
            to_json(&view)
        }
        IdeaCommand::View { idea_id } => {
            let idea = app.backend().record_view(&idea_id).await.map_err(report)?;
            to_json(&idea)
        }
        IdeaCommand::Share { idea_id } => {
            let idea = app.backend().record_share(&idea_id).await.map_err(report)?;
            to_json(&idea)
        }
    }
}

async fn run_comment(app: &App, command: CommentCommand) -> Result<Value> {
    let coordinator = &app.coordinator;
    match command {
        CommentCommand::Add { target, text } => {
            let comment = coordinator
                .add_comment(&target, &text)
                .await
                .map_err(report)?;
            to_json(&comment)
        }
        CommentCommand::Reply {
            parent_comment_id,
            text,
        } => {
            let comment = coordinator
                .add_reply(&parent_comment_id, &text)
                .await
                .map_err(report)?;
            to_json(&comment)
        }
        CommentCommand::Vote {
            comment_id,
            direction,
        } => {
            if coordinator.comment(&comment_id).is_none() {
                let comment = app
                    .backend()
                    .get_comment(&comment_id)
                    .await
                    .map_err(report)?
                    .ok_or_else(|| report(EngineError::not_found("comment", comment_id.clone())))?;
                coordinator
                    .load_comments(&comment.entity())
                    .await
                    .map_err(report)?;
            }
            let outcome = coordinator
                .vote_comment(&comment_id, direction)
                .await
                .map_err(report)?;
            to_json(&outcome)
        }
        CommentCommand::Thread { target } => {
            let thread = coordinator.load_comments(&target).await.map_err(report)?;
            Ok(json!({ "entity": target.to_string(), "comments": to_json(&thread)? }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Config;
    use ideaforge_engine::{EntityRef, VoteDirection};
    use tempfile::tempdir;

    fn config(data_file: std::path::PathBuf, user: &str) -> Config {
        Config {
            store_url: None,
            api_key: None,
            access_token: None,
            data_file: Some(data_file),
            user: user.to_string(),
            user_name: None,
            timeout_secs: 12,
            cache_ms: 5000,
        }
    }

    #[tokio::test]
    async fn local_session_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");

        let alice = App::connect(&config(path.clone(), "alice")).await.unwrap();
        let created = run(
            &alice,
            Commands::Idea {
                command: IdeaCommand::Create {
                    title: "Community garden".into(),
                    body: String::new(),
                },
            },
        )
        .await
        .unwrap();
        let idea_id = created["idea"]["id"].as_str().unwrap().to_string();

        // A second invocation sees the first one's writes.
        let bob = App::connect(&config(path, "bob")).await.unwrap();
        let vote = run(
            &bob,
            Commands::Vote {
                idea_id: idea_id.clone(),
                direction: VoteDirection::Up,
            },
        )
        .await
        .unwrap();
        assert_eq!(vote["votes"], 1);
        assert_eq!(vote["influence"], 99);

        let fork = run(
            &bob,
            Commands::Fork {
                idea_id: idea_id.clone(),
                key: Some("k1".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(fork["source_forks"], 1);

        let comment = run(
            &bob,
            Commands::Comment {
                command: CommentCommand::Add {
                    target: EntityRef::idea(idea_id.clone()),
                    text: "Count me in".into(),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(comment["author_id"], "bob");

        drop(alice);
        let alice = App::connect(&config(dir.path().join("data.json"), "alice"))
            .await
            .unwrap();
        let notes = run(&alice, Commands::Notifications).await.unwrap();
        let kinds: Vec<&str> = notes
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, ["comment", "fork"]);
    }

    #[tokio::test]
    async fn missing_idea_is_an_error() {
        let dir = tempdir().unwrap();
        let app = App::connect(&config(dir.path().join("data.json"), "alice"))
            .await
            .unwrap();
        let err = run(
            &app,
            Commands::Idea {
                command: IdeaCommand::Show {
                    idea_id: "nope".into(),
                },
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
