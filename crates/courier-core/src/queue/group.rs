//! Group commands
//!
//! Outbound commands are persisted as messages in the group's thread and
//! applied to the local group right away. Inbound commands are applied when
//! the message arrives.

use tracing::{debug, info};

use super::worker::Worker;
use crate::error::{CourierError, CourierResult};
use crate::storage::{MessageStore, ThreadStore};
use crate::types::{
    Group, GroupCommand, GroupRef, Identity, InboundGroup, Membership, MessageId, NewMessage,
    RequestId, ThreadId, GROUP_COMMAND_MIME,
};

impl Worker {
    fn self_identity(&self) -> CourierResult<Identity> {
        self.config
            .self_identity
            .clone()
            .ok_or_else(|| CourierError::InvalidOperation("self identity not configured".into()))
    }

    fn load_group(&self, id: &Identity) -> CourierResult<Group> {
        self.repo
            .group(id)?
            .ok_or_else(|| CourierError::GroupNotFound(id.to_string()))
    }

    pub(super) fn create_group(
        &mut self,
        id: Identity,
        members: Vec<Identity>,
        subject: Option<String>,
    ) -> CourierResult<MessageId> {
        let me = self.self_identity()?;
        let thread = self.repo.ensure_thread(&id, true)?;

        let mut group = Group::new(id.clone(), me.clone(), thread.id);
        group.subject = subject.clone();
        for member in members.iter().filter(|m| **m != me) {
            group.add_member(member.clone());
        }
        self.repo.save_group(&group)?;
        info!(group = %id, members = group.members.len(), "Group created");

        self.send_group_command(&mut group, GroupCommand::Create { members, subject })
    }

    pub(super) fn add_group_members(
        &mut self,
        id: &Identity,
        members: Vec<Identity>,
    ) -> CourierResult<MessageId> {
        let me = self.self_identity()?;
        let mut group = self.load_group(id)?;
        let existing = group.live_members();
        for member in members.iter().filter(|m| **m != me) {
            group.add_member(member.clone());
        }
        self.repo.save_group(&group)?;

        let command = GroupCommand::Members {
            added: members,
            removed: Vec::new(),
            existing,
        };
        self.send_group_command(&mut group, command)
    }

    pub(super) fn remove_group_members(
        &mut self,
        id: &Identity,
        members: Vec<Identity>,
    ) -> CourierResult<MessageId> {
        let mut group = self.load_group(id)?;
        let existing = group.live_members();
        for member in &members {
            group.kick_member(member);
        }
        self.repo.save_group(&group)?;

        let command = GroupCommand::Members {
            added: Vec::new(),
            removed: members,
            existing,
        };
        self.send_group_command(&mut group, command)
    }

    pub(super) fn set_group_subject(
        &mut self,
        id: &Identity,
        subject: String,
    ) -> CourierResult<MessageId> {
        let mut group = self.load_group(id)?;
        group.subject = Some(subject.clone());
        self.repo.save_group(&group)?;
        self.send_group_command(&mut group, GroupCommand::SetSubject { subject })
    }

    pub(super) fn leave_group(&mut self, id: &Identity) -> CourierResult<MessageId> {
        let mut group = self.load_group(id)?;
        let message = self.send_group_command(&mut group, GroupCommand::Part)?;
        group.membership = Membership::Parted;
        self.repo.save_group(&group)?;
        info!(group = %id, "Left group");
        Ok(message)
    }

    /// Persist a command message in the group's thread and dispatch it
    fn send_group_command(
        &mut self,
        group: &mut Group,
        command: GroupCommand,
    ) -> CourierResult<MessageId> {
        let thread = self.repo.ensure_thread(&group.id, true)?;
        if thread.id != group.thread_id {
            group.thread_id = thread.id;
            self.repo.save_group(group)?;
        }

        let body = command.describe();
        let mut new = NewMessage::outgoing(thread.id, group.id.clone(), GROUP_COMMAND_MIME)
            .with_group(GroupRef {
                id: group.id.clone(),
                owner: group.owner.clone(),
            })
            .with_group_command(command)
            .with_body(body);
        new.server_id = Some(RequestId::new().to_string());

        let message = self.repo.insert_message(new)?;
        debug!(id = %message.id, group = %group.id, "Group command queued");
        self.dispatch_fresh(&message)?;
        Ok(message.id)
    }

    /// Apply the group part of an inbound message to the local group
    pub(super) fn apply_inbound_group(
        &self,
        inbound: &InboundGroup,
        sender: &Identity,
        thread_id: ThreadId,
    ) -> CourierResult<()> {
        let me = self.config.self_identity.clone();
        let is_me = |id: &Identity| me.as_ref() == Some(id);

        let mut group = self
            .repo
            .group(&inbound.id)?
            .unwrap_or_else(|| Group::new(inbound.id.clone(), inbound.owner.clone(), thread_id));
        group.owner = inbound.owner.clone();
        group.thread_id = thread_id;

        let admit = |group: &mut Group, id: &Identity| {
            if is_me(id) {
                group.membership = Membership::Member;
            } else {
                group.add_member(id.clone());
            }
        };

        match &inbound.command {
            None => {
                if !is_me(sender) && !group.is_member(sender) {
                    admit(&mut group, sender);
                }
            }
            Some(GroupCommand::Create { members, subject }) => {
                for member in members {
                    admit(&mut group, member);
                }
                let owner = group.owner.clone();
                admit(&mut group, &owner);
                group.subject = subject.clone();
            }
            Some(GroupCommand::Members {
                added,
                removed,
                existing,
            }) => {
                for member in added.iter().chain(existing) {
                    admit(&mut group, member);
                }
                let owner = group.owner.clone();
                admit(&mut group, &owner);
                for member in removed {
                    if is_me(member) {
                        group.membership = Membership::Kicked;
                    } else {
                        group.kick_member(member);
                    }
                }
            }
            Some(GroupCommand::SetSubject { subject }) => {
                group.subject = Some(subject.clone());
            }
            Some(GroupCommand::Part) => {
                if is_me(sender) {
                    group.membership = Membership::Parted;
                } else {
                    group.remove_member(sender);
                }
            }
        }

        self.repo.save_group(&group)?;
        debug!(group = %group.id, members = group.live_members().len(), "Group updated from inbound message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusEvent, EventBus};
    use crate::config::CourierConfig;
    use crate::crypto::PlaintextCrypto;
    use crate::queue::NoopNotifier;
    use crate::storage::RedbRepository;
    use crate::types::MessageStatus;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn id(s: &str) -> Identity {
        Identity::new(s)
    }

    fn worker() -> (tempfile::TempDir, Worker, mpsc::UnboundedReceiver<BusEvent>) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(RedbRepository::open(dir.path().join("courier.redb")).unwrap());
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let worker = Worker::new(
            repo,
            bus,
            Arc::new(PlaintextCrypto),
            Arc::new(NoopNotifier),
            CourierConfig::new(id("me@x"), "x"),
        );
        (dir, worker, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> Vec<BusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_create_group_persists_and_sends_command() {
        let (_dir, mut worker, mut rx) = worker();
        let cmd = worker
            .create_group(
                id("g1@x"),
                vec![id("alice@x"), id("bob@x"), id("me@x")],
                Some("Trip".into()),
            )
            .unwrap();

        let group = worker.repo.group(&id("g1@x")).unwrap().unwrap();
        assert_eq!(group.owner, id("me@x"));
        assert_eq!(group.live_members(), vec![id("alice@x"), id("bob@x")]);
        assert_eq!(group.subject.as_deref(), Some("Trip"));

        let message = worker.repo.message(cmd).unwrap().unwrap();
        assert!(message.is_group_command());
        assert_eq!(message.thread_id, group.thread_id);
        assert_eq!(drain(&mut rx), vec![BusEvent::SendMessageRequest { id: cmd }]);
    }

    #[test]
    fn test_second_command_waits_for_first_ack() {
        let (_dir, mut worker, mut rx) = worker();
        let create = worker
            .create_group(id("g1@x"), vec![id("alice@x")], None)
            .unwrap();
        let add = worker
            .add_group_members(&id("g1@x"), vec![id("bob@x")])
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![BusEvent::SendMessageRequest { id: create }]
        );

        worker
            .apply_event(BusEvent::MessageSent { id: create })
            .unwrap();
        assert_eq!(drain(&mut rx), vec![BusEvent::SendMessageRequest { id: add }]);
        assert_eq!(
            worker.repo.message(create).unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn test_leave_and_remove() {
        let (_dir, mut worker, _rx) = worker();
        worker
            .create_group(id("g1@x"), vec![id("alice@x"), id("bob@x")], None)
            .unwrap();
        worker
            .remove_group_members(&id("g1@x"), vec![id("bob@x")])
            .unwrap();
        worker.set_group_subject(&id("g1@x"), "New".into()).unwrap();
        worker.leave_group(&id("g1@x")).unwrap();

        let group = worker.repo.group(&id("g1@x")).unwrap().unwrap();
        assert_eq!(group.live_members(), vec![id("alice@x")]);
        assert_eq!(group.subject.as_deref(), Some("New"));
        assert_eq!(group.membership, Membership::Parted);

        let err = worker.leave_group(&id("nope@x")).unwrap_err();
        assert!(matches!(err, CourierError::GroupNotFound(_)));
    }

    #[test]
    fn test_inbound_commands() {
        let (_dir, worker, _rx) = worker();
        let thread = worker.repo.ensure_thread(&id("g2@x"), true).unwrap();
        let owner = id("olga@x");
        let group = |command| InboundGroup {
            id: id("g2@x"),
            owner: owner.clone(),
            command: Some(command),
        };

        worker
            .apply_inbound_group(
                &group(GroupCommand::Create {
                    members: vec![id("me@x"), id("alice@x")],
                    subject: Some("Band".into()),
                }),
                &owner,
                thread.id,
            )
            .unwrap();
        let g = worker.repo.group(&id("g2@x")).unwrap().unwrap();
        assert_eq!(g.live_members(), vec![id("alice@x"), id("olga@x")]);
        assert_eq!(g.membership, Membership::Member);

        worker
            .apply_inbound_group(&group(GroupCommand::Part), &id("alice@x"), thread.id)
            .unwrap();
        worker
            .apply_inbound_group(
                &group(GroupCommand::Members {
                    added: vec![],
                    removed: vec![id("me@x")],
                    existing: vec![],
                }),
                &owner,
                thread.id,
            )
            .unwrap();
        let g = worker.repo.group(&id("g2@x")).unwrap().unwrap();
        assert_eq!(g.live_members(), vec![id("olga@x")]);
        assert_eq!(g.membership, Membership::Kicked);
    }
}
