#[cfg(test)]
mod tests {
    use serial_test::serial;
    use shuffle_exchange::exchange::clear_factories;
    use shuffle_exchange::{
        BincodeCodec, EnqueueStatus, ExchangeClient, ExchangeConfig, LocalExchangeSource,
        MemoryPool, OutputBufferConfig, OutputBufferManager, OutputKind, Page, PageCodec,
    };
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn setup(buffer: OutputBufferConfig) -> Arc<OutputBufferManager> {
        clear_factories();
        let manager = OutputBufferManager::new(buffer);
        LocalExchangeSource::register(Arc::clone(&manager));
        manager
    }

    async fn read_rows(
        client: &ExchangeClient,
        codec: &BincodeCodec<Vec<u64>>,
    ) -> anyhow::Result<Vec<u64>> {
        let mut rows = Vec::new();
        loop {
            let batch = client.next(1 << 16)?;
            for page in &batch.pages {
                rows.extend(codec.decode(page)?);
            }
            if batch.at_end {
                return Ok(rows);
            }
            if batch.future.is_valid() {
                assert!(batch.future.wait_for(WAIT).await, "consumer stalled");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[serial]
    async fn test_blocked_producer_makes_progress() -> anyhow::Result<()> {
        // Ceiling of a few pages forces the producer to block repeatedly.
        let manager = setup(OutputBufferConfig::default().with_max_buffer_size(4096));
        let codec = BincodeCodec::<Vec<u64>>::new();
        manager.initialize_task("p", OutputKind::Partitioned, 1)?;

        let producer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let codec = BincodeCodec::<Vec<u64>>::new();
                let mut blocked = 0u32;
                for batch in 0..200u64 {
                    let rows: Vec<u64> = (batch * 100..batch * 100 + 100).collect();
                    match manager.enqueue("p", 0, codec.encode(&rows)?)? {
                        EnqueueStatus::Ready => {}
                        EnqueueStatus::Blocked(future) => {
                            blocked += 1;
                            assert!(future.wait_for(WAIT).await, "producer never released");
                        }
                    }
                }
                manager.no_more_data("p")?;
                anyhow::Ok(blocked)
            })
        };

        let client = ExchangeClient::new(
            "consumer",
            0,
            ExchangeConfig::default().with_max_queued_bytes(8192),
            MemoryPool::new_root("exchange"),
        )?;
        client.add_remote_task_id("local://p")?;
        client.no_more_remote_tasks();

        let rows = read_rows(&client, &codec).await?;
        let blocked = producer.await??;

        assert!(blocked > 0);
        assert_eq!(rows.len(), 20_000);
        let unique: HashSet<u64> = rows.iter().copied().collect();
        assert_eq!(unique.len(), 20_000);
        // Single producer: order is preserved.
        assert!(rows.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[serial]
    async fn test_arbitrary_output_split_between_consumers() -> anyhow::Result<()> {
        let manager = setup(OutputBufferConfig::default());
        let codec = BincodeCodec::<Vec<u64>>::new();
        manager.initialize_task("p", OutputKind::Arbitrary, 2)?;
        for batch in 0..40u64 {
            let rows: Vec<u64> = (batch * 10..batch * 10 + 10).collect();
            manager.enqueue("p", 0, codec.encode(&rows)?)?;
        }
        manager.no_more_data("p")?;

        let mut clients = Vec::new();
        for destination in 0..2 {
            let client = ExchangeClient::new(
                format!("consumer-{destination}"),
                destination,
                ExchangeConfig::default().with_max_queued_bytes(512),
                MemoryPool::new_root("exchange"),
            )?;
            client.add_remote_task_id("local://p")?;
            client.no_more_remote_tasks();
            clients.push(client);
        }

        let (a, b) = tokio::join!(read_rows(&clients[0], &codec), read_rows(&clients[1], &codec));
        let mut rows = a?;
        rows.extend(b?);
        rows.sort_unstable();
        assert_eq!(rows, (0..400).collect::<Vec<u64>>());
        assert_eq!(manager.stats("p").map(|s| s.buffered_bytes), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_task_releases_blocked_producers() -> anyhow::Result<()> {
        let manager = OutputBufferManager::new(OutputBufferConfig::default().with_max_buffer_size(100));
        manager.initialize_task("p", OutputKind::Broadcast, 3)?;

        let mut futures = Vec::new();
        for _ in 0..3 {
            futures.push(manager.enqueue("p", 1, Page::zeroed(100))?.into_future());
        }
        assert_eq!(manager.stats("p").map(|s| s.blocked_producers), Some(3));
        assert_eq!(manager.pool().current(), 300);

        assert!(manager.remove_task("p"));
        for future in futures {
            assert!(future.wait_for(Duration::from_millis(100)).await);
        }
        assert_eq!(manager.pool().current(), 0);
        assert!(manager.get_data("p", 0, 100, 0).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_blocked_producers_released_in_order() -> anyhow::Result<()> {
        let manager = OutputBufferManager::new(OutputBufferConfig::default().with_max_buffer_size(100));
        manager.initialize_task("p", OutputKind::Partitioned, 1)?;

        let mut first = manager.enqueue("p", 0, Page::zeroed(100))?.into_future();
        let mut second = manager.enqueue("p", 0, Page::zeroed(50))?.into_future();
        assert!(!first.is_ready());
        assert!(!second.is_ready());

        // 50 bytes left is under the 90-byte release threshold.
        manager.acknowledge("p", 0, 1)?;
        assert!(first.is_ready());
        assert!(second.is_ready());
        assert_eq!(manager.stats("p").map(|s| s.buffered_bytes), Some(50));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_data_implicitly_acknowledges() -> anyhow::Result<()> {
        let manager = OutputBufferManager::new(OutputBufferConfig::default());
        manager.initialize_task("p", OutputKind::Partitioned, 1)?;
        for size in [10, 20, 30] {
            manager.enqueue("p", 0, Page::zeroed(size))?;
        }

        let first = manager.get_data("p", 0, 15, 0)?;
        assert_eq!(first.pages.len(), 1);

        let second = manager.get_data("p", 0, 1_000, first.next_sequence())?;
        assert_eq!(second.sequence, 1);
        assert_eq!(second.bytes(), 50);
        assert_eq!(manager.stats("p").map(|s| s.buffered_bytes), Some(50));
        Ok(())
    }
}
