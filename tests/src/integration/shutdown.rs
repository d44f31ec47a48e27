//! # Shutdown and Fatal Failures
//!
//! Stop lets the message in hand finish, then releases the receiver. A
//! receive machinery failure faults the instance for good.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use cqs_bus::{
        BusConfig, BusError, Container, InMemoryTransport, LoopState, RequestReplyBus,
        SessionAcceptor, Transport,
    };

    use crate::fixtures::*;

    fn slow_container(started: &Arc<AtomicUsize>, finished: &Arc<AtomicUsize>) -> Arc<Container> {
        let (started, finished) = (started.clone(), finished.clone());
        let mut container = Container::new();
        container.register_command_handler::<SlowCommand, _>(move |_| SlowHandler {
            started: started.clone(),
            finished: finished.clone(),
        });
        Arc::new(container)
    }

    // =============================================================================
    // GRACEFUL STOP
    // =============================================================================

    #[tokio::test]
    async fn test_stop_waits_for_message_in_hand() {
        let (transport, factory) = factory();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let listener = factory.create_command_listener(slow_container(&started, &finished));
        listener.start().unwrap();

        let bus = factory.create_command_bus().unwrap();
        bus.send(SlowCommand { millis: 200 }).await.unwrap();
        wait_until(|| started.load(Ordering::SeqCst) == 1).await;

        listener.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(listener.state(), LoopState::Stopped);
        assert_eq!(transport.queue_len(bus.queue()), 0);
        assert_eq!(transport.in_flight(bus.queue()), 0);
    }

    #[tokio::test]
    async fn test_messages_after_stop_stay_queued() {
        let (transport, factory) = factory();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let listener = factory.create_command_listener(slow_container(&started, &finished));
        listener.start().unwrap();
        listener.stop().await;

        let bus = factory.create_command_bus().unwrap();
        bus.send(SlowCommand { millis: 1 }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(transport.queue_len(bus.queue()), 1);
    }

    #[tokio::test]
    async fn test_second_stop_returns_immediately() {
        let (_transport, factory) = factory();
        let listener = factory.create_command_listener(Arc::new(Container::new()));
        listener.start().unwrap();
        listener.stop().await;

        let begin = Instant::now();
        listener.stop().await;
        assert!(begin.elapsed() < Duration::from_millis(50));
        assert_eq!(listener.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_marks_stopped() {
        let (_transport, factory) = factory();
        let listener = factory.create_event_listener(Arc::new(Container::new()));
        assert_eq!(listener.state(), LoopState::Idle);

        listener.stop().await;
        assert_eq!(listener.state(), LoopState::Stopped);
        assert_eq!(listener.start().unwrap_err(), BusError::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (_transport, factory) = factory();
        let listener = factory.create_request_reply_listener(Arc::new(Container::new()));
        listener.start().unwrap();
        assert_eq!(listener.start().unwrap_err(), BusError::AlreadyStarted);
        listener.stop().await;

        let bus = factory.create_request_reply_bus().unwrap();
        assert_eq!(bus.start().unwrap_err(), BusError::AlreadyStarted);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_reply_session() {
        let (transport, factory) = factory();
        let bus = factory.create_request_reply_bus().unwrap();
        let reply_queue = bus.queues().reply_queue.clone();
        wait_until(|| transport.is_session_locked(&reply_queue, bus.session_id().as_str())).await;

        bus.stop().await;
        assert!(!transport.is_session_locked(&reply_queue, bus.session_id().as_str()));
        assert_eq!(bus.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_does_not_fail_outstanding_calls() {
        let config = BusConfig {
            reply_timeout: Some(Duration::from_millis(300)),
            ..fast_config()
        };
        let (_transport, factory) = factory_with(config);
        let bus = factory.create_request_reply_bus().unwrap();

        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.execute(Ping(1)).await })
        };
        wait_until(|| bus.pending_count() == 1).await;
        bus.stop().await;
        assert_eq!(bus.pending_count(), 1);

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
        assert_eq!(bus.execute(Ping(2)).await.unwrap_err(), BusError::Stopped);
    }

    // =============================================================================
    // FATAL FAILURES
    // =============================================================================

    #[tokio::test]
    async fn test_missing_queue_faults_listener() {
        let transport = InMemoryTransport::strict(&[]);
        let factory = factory_over(&transport, fast_config());
        let listener = factory.create_command_listener(Arc::new(Container::new()));
        let mut notices = listener.failures().channel();
        listener.start().unwrap();

        let notice = notices.recv().await.unwrap();
        assert!(notice.is_fatal());
        assert!(notice.envelope.is_none());

        listener.stop().await;
        assert_eq!(listener.state(), LoopState::Faulted);
    }

    #[tokio::test]
    async fn test_locked_session_fails_waiting_callers() {
        let transport = InMemoryTransport::new();
        let config = fast_config();
        let shared: Arc<dyn Transport> = Arc::new(transport.clone());
        let bus = RequestReplyBus::new(shared, config.request_reply.clone(), &config).unwrap();

        let _squatter = transport
            .sessions(&config.request_reply.reply_queue)
            .unwrap()
            .accept_session(bus.session_id())
            .await
            .unwrap();

        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.execute(Ping(7)).await })
        };
        wait_until(|| bus.pending_count() == 1).await;

        let mut notices = bus.failures().channel();
        bus.start().unwrap();

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::FatalBus(_)));
        assert!(notices.recv().await.unwrap().is_fatal());
        assert_eq!(bus.pending_count(), 0);

        bus.stop().await;
        assert_eq!(bus.state(), LoopState::Faulted);
        assert!(matches!(
            bus.execute(Ping(8)).await.unwrap_err(),
            BusError::FatalBus(_)
        ));
    }
}
