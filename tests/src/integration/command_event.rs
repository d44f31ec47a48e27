//! # Command and Event Flows
//!
//! One-way traffic: the sender resolves as soon as the transport accepted
//! the message; failures surface on the listener's notifier, where the
//! disposition decides whether the message is redelivered.

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use cqs_bus::{
        BusError, Codec, Container, FailureNotice, InMemoryTransport, MessageHandling, QueueSender,
        Scope, Transport,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::fixtures::*;

    fn audit_container(log: &Arc<Mutex<Vec<String>>>) -> Arc<Container> {
        let mut container = Container::new();
        let log = log.clone();
        container.register_command_handler::<Audit, _>(move |_| AuditHandler { log: log.clone() });
        Arc::new(container)
    }

    fn drain(notices: &mut UnboundedReceiver<FailureNotice>) -> Vec<FailureNotice> {
        let mut seen = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            seen.push(notice);
        }
        seen
    }

    // =============================================================================
    // COMMANDS
    // =============================================================================

    #[tokio::test]
    async fn test_command_is_handled_once_and_completed() {
        let (transport, factory) = factory();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = factory.create_command_listener(audit_container(&log));
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let bus = factory.create_command_bus().unwrap();
        bus.send(Audit {
            entry: "opened".into(),
        })
        .await
        .unwrap();

        wait_until(|| log.lock().len() == 1).await;
        listener.stop().await;

        assert_eq!(*log.lock(), vec!["opened".to_string()]);
        assert_eq!(transport.queue_len(bus.queue()), 0);
        assert_eq!(transport.in_flight(bus.queue()), 0);
        assert!(drain(&mut notices).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_is_abandoned_by_default() {
        let transport = InMemoryTransport::new().with_max_delivery_count(2);
        let factory = factory_over(&transport, fast_config());
        let listener = factory.create_command_listener(Arc::new(Container::new()));
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let queue = factory.config().command_queue.clone();
        let stray = Codec::Json.envelope("Unheard", &1u32).unwrap();
        transport.sender(&queue).unwrap().send(stray).await.unwrap();

        wait_until(|| transport.dead_letters(&queue).len() == 1).await;
        listener.stop().await;

        let seen = drain(&mut notices);
        assert_eq!(seen.len(), 2);
        for notice in &seen {
            assert!(matches!(notice.error, BusError::UnknownMessage(_)));
            assert_eq!(notice.disposition(), MessageHandling::PutMessageBackInQueue);
        }
        assert_eq!(transport.queue_len(&queue), 0);
    }

    #[tokio::test]
    async fn test_unknown_command_is_removed_when_subscriber_overrides() {
        let (transport, factory) = factory();
        let listener = factory.create_command_listener(Arc::new(Container::new()));
        listener.failures().subscribe(|notice| {
            if matches!(notice.error, BusError::UnknownMessage(_)) {
                notice.set_disposition(MessageHandling::RemoveMessage);
            }
        });
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let queue = factory.config().command_queue.clone();
        let stray = Codec::Json.envelope("Unheard", &1u32).unwrap();
        transport.sender(&queue).unwrap().send(stray).await.unwrap();

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.disposition(), MessageHandling::RemoveMessage);
        listener.stop().await;

        assert_eq!(transport.queue_len(&queue), 0);
        assert_eq!(transport.in_flight(&queue), 0);
        assert!(transport.dead_letters(&queue).is_empty());
        assert!(drain(&mut notices).is_empty());
    }

    #[tokio::test]
    async fn test_command_without_handler_reports_no_handler() {
        let (_transport, factory) = factory();
        let mut container = Container::new();
        container.register_command_type::<Audit>();
        let listener = factory.create_command_listener(Arc::new(container));
        listener.failures().subscribe(|notice| {
            notice.set_disposition(MessageHandling::RemoveMessage);
        });
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        factory
            .create_command_bus()
            .unwrap()
            .send(Audit {
                entry: "orphan".into(),
            })
            .await
            .unwrap();

        let notice = notices.recv().await.unwrap();
        assert_eq!(
            notice.error,
            BusError::NoHandler {
                message_type: "Audit".into()
            }
        );
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_command_fault_is_reported_and_redelivered() {
        let transport = InMemoryTransport::new().with_max_delivery_count(3);
        let factory = factory_over(&transport, fast_config());
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = factory.create_command_listener(audit_container(&log));
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let bus = factory.create_command_bus().unwrap();
        bus.send(Audit {
            entry: "reject".into(),
        })
        .await
        .unwrap();

        wait_until(|| transport.dead_letters(bus.queue()).len() == 1).await;
        listener.stop().await;

        let seen = drain(&mut notices);
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0].error, BusError::Fault(ref f) if f.is_kind("Rejected")));
        assert!(log.lock().is_empty());
    }

    // =============================================================================
    // SUCCESS HOOK
    // =============================================================================

    /// Scoped service shared by the handler and the hook of one message.
    struct UnitOfWork {
        trail: Arc<Mutex<Vec<&'static str>>>,
    }

    struct RecordingHandler {
        work: Option<Arc<UnitOfWork>>,
    }

    #[async_trait::async_trait]
    impl cqs_bus::CommandHandler<Audit> for RecordingHandler {
        async fn execute(&self, command: Audit) -> Result<(), cqs_bus::Fault> {
            if let Some(work) = &self.work {
                work.trail.lock().push("handled");
            }
            if command.entry == "reject" {
                return Err(cqs_bus::Fault::new("Rejected", "no"));
            }
            Ok(())
        }
    }

    fn unit_of_work_container(trail: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Container> {
        let mut container = Container::new();
        let trail = trail.clone();
        container
            .register_scoped(move |scope: &Scope| {
                let disposed = trail.clone();
                scope.on_dispose(move || disposed.lock().push("disposed"));
                UnitOfWork {
                    trail: trail.clone(),
                }
            })
            .register_command_handler::<Audit, _>(|scope| RecordingHandler {
                work: scope.get::<UnitOfWork>(),
            });
        Arc::new(container)
    }

    #[tokio::test]
    async fn test_success_hook_runs_after_handler_and_before_disposal() {
        let (_transport, factory) = factory();
        let trail = Arc::new(Mutex::new(Vec::new()));
        let listener = factory.create_command_listener(unit_of_work_container(&trail));
        listener.on_success(|scope| {
            if let Some(work) = scope.get::<UnitOfWork>() {
                work.trail.lock().push("hook");
            }
            Ok(())
        });
        listener.start().unwrap();

        factory
            .create_command_bus()
            .unwrap()
            .send(Audit {
                entry: "ok".into(),
            })
            .await
            .unwrap();

        wait_until(|| trail.lock().len() == 3).await;
        listener.stop().await;
        assert_eq!(*trail.lock(), vec!["handled", "hook", "disposed"]);
    }

    #[tokio::test]
    async fn test_success_hook_skipped_on_failure() {
        let (_transport, factory) = factory();
        let trail = Arc::new(Mutex::new(Vec::new()));
        let listener = factory.create_command_listener(unit_of_work_container(&trail));
        let hook_runs = Arc::new(AtomicUsize::new(0));
        {
            let hook_runs = hook_runs.clone();
            listener.on_success(move |_| {
                hook_runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        listener.failures().subscribe(|notice| {
            notice.set_disposition(MessageHandling::RemoveMessage);
        });
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        factory
            .create_command_bus()
            .unwrap()
            .send(Audit {
                entry: "reject".into(),
            })
            .await
            .unwrap();

        notices.recv().await.unwrap();
        listener.stop().await;
        assert_eq!(hook_runs.load(Ordering::SeqCst), 0);
        assert_eq!(*trail.lock(), vec!["handled", "disposed"]);
    }

    #[tokio::test]
    async fn test_failing_hook_counts_as_handler_failure() {
        let (transport, factory) = factory();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = factory.create_command_listener(audit_container(&log));
        listener.on_success(|_| Err(cqs_bus::Fault::new("CommitFailed", "disk full")));
        listener.failures().subscribe(|notice| {
            notice.set_disposition(MessageHandling::RemoveMessage);
        });
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let bus = factory.create_command_bus().unwrap();
        bus.send(Audit {
            entry: "opened".into(),
        })
        .await
        .unwrap();

        let notice = notices.recv().await.unwrap();
        assert!(matches!(notice.error, BusError::Fault(ref f) if f.is_kind("CommitFailed")));
        listener.stop().await;
        assert_eq!(transport.queue_len(bus.queue()), 0);
    }

    // =============================================================================
    // EVENTS
    // =============================================================================

    #[tokio::test]
    async fn test_every_subscriber_sees_the_event() {
        let (transport, factory) = factory();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut container = Container::new();
        for seen in [first.clone(), second.clone()] {
            container.register_event_subscriber::<Shipped, _>(move |_| ShipmentSubscriber {
                seen: seen.clone(),
                fail_on: None,
            });
        }
        let listener = factory.create_event_listener(Arc::new(container));
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let bus = factory.create_event_bus().unwrap();
        bus.publish(Shipped { order: 1 }).await.unwrap();
        bus.publish(Shipped { order: 2 }).await.unwrap();

        wait_until(|| first.load(Ordering::SeqCst) == 2 && second.load(Ordering::SeqCst) == 2).await;
        listener.stop().await;
        assert_eq!(transport.queue_len(bus.queue()), 0);
        assert!(drain(&mut notices).is_empty());
    }

    #[tokio::test]
    async fn test_event_without_subscribers_is_completed() {
        let (transport, factory) = factory();
        let mut container = Container::new();
        container.register_event_type::<Shipped>();
        let listener = factory.create_event_listener(Arc::new(container));
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let bus = factory.create_event_bus().unwrap();
        bus.publish(Shipped { order: 1 }).await.unwrap();

        wait_until(|| transport.queue_len(bus.queue()) == 0 && transport.in_flight(bus.queue()) == 0)
            .await;
        listener.stop().await;
        assert!(drain(&mut notices).is_empty());
        assert!(transport.dead_letters(bus.queue()).is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_failure_is_reported() {
        let (_transport, factory) = factory();
        let healthy = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(AtomicUsize::new(0));
        let mut container = Container::new();
        {
            let healthy = healthy.clone();
            let failing = failing.clone();
            container
                .register_event_subscriber::<Shipped, _>(move |_| ShipmentSubscriber {
                    seen: healthy.clone(),
                    fail_on: None,
                })
                .register_event_subscriber::<Shipped, _>(move |_| ShipmentSubscriber {
                    seen: failing.clone(),
                    fail_on: Some(9),
                });
        }
        let listener = factory.create_event_listener(Arc::new(container));
        listener.failures().subscribe(|notice| {
            notice.set_disposition(MessageHandling::RemoveMessage);
        });
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        factory
            .create_event_bus()
            .unwrap()
            .publish(Shipped { order: 9 })
            .await
            .unwrap();

        let notice = notices.recv().await.unwrap();
        assert!(matches!(notice.error, BusError::Fault(ref f) if f.is_kind("ShipmentRejected")));
        listener.stop().await;
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
        assert_eq!(failing.load(Ordering::SeqCst), 1);
    }
}
