#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chunkstore::storage::memory::MemoryStore;
    use chunkstore::*;
    use proptest::prelude::*;

    /// Splits `data` at the given offsets (taken modulo its length).
    fn split_at_points(data: &[u8], points: &[usize]) -> Vec<Vec<u8>> {
        let mut cuts: Vec<usize> = points.iter().map(|p| p % (data.len() + 1)).collect();
        cuts.push(0);
        cuts.push(data.len());
        cuts.sort_unstable();
        cuts.windows(2).map(|w| data[w[0]..w[1]].to_vec()).collect()
    }

    /// Writes `parts` through a fresh file and returns the stored chunk sizes
    /// plus the bytes read back.
    async fn write_parts(
        content: &[u8],
        parts: &[Vec<u8>],
        chunk_size: usize,
    ) -> (Vec<usize>, Vec<u8>) {
        let store = Arc::new(MemoryStore::new());
        let catalog = Catalog::new(store.clone()).with_chunk_size(chunk_size).unwrap();
        let handle = catalog
            .save(NewFile::for_content("prop.bin", content))
            .await
            .unwrap();

        let mut sink = handle.write_stream().unwrap();
        for part in parts {
            sink.submit(part).await.unwrap();
        }
        let summary = sink.finish().await.unwrap();
        assert_eq!(summary.byte_count, content.len() as u64);

        let chunks = store.chunks(&handle.metadata().id).await;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_number, i as u64);
        }
        let sizes = chunks.iter().map(|c| c.size()).collect();
        let mut out = Vec::new();
        handle.download_to(&mut out).await.unwrap();
        (sizes, out)
    }

    fn expected_sizes(len: usize, chunk_size: usize) -> Vec<usize> {
        let mut sizes = vec![chunk_size; len / chunk_size];
        if len % chunk_size != 0 {
            sizes.push(len % chunk_size);
        }
        sizes
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn chunk_layout_ignores_buffer_boundaries(
            content in prop::collection::vec(any::<u8>(), 0..300),
            points in prop::collection::vec(any::<usize>(), 0..12),
            chunk_size in 1usize..32,
        ) {
            let parts = split_at_points(&content, &points);
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (sizes, read_back) = rt.block_on(write_parts(&content, &parts, chunk_size));

            prop_assert_eq!(sizes, expected_sizes(content.len(), chunk_size));
            prop_assert_eq!(read_back, content);
        }
    }

    #[tokio::test]
    async fn test_byte_at_a_time_matches_single_buffer() {
        let content: Vec<u8> = (0u8..=250).collect();
        let single = write_parts(&content, &[content.clone()], 7).await;
        let bytes: Vec<Vec<u8>> = content.iter().map(|b| vec![*b]).collect();
        let trickled = write_parts(&content, &bytes, 7).await;
        assert_eq!(single, trickled);
    }

    #[tokio::test]
    async fn test_stream_from_async_reader() {
        let content = vec![42u8; 100_000];
        let store = Arc::new(MemoryStore::new());
        let catalog = Catalog::new(store.clone()).with_chunk_size(4096).unwrap();
        let handle = catalog
            .save(NewFile::for_content("big.bin", &content))
            .await
            .unwrap();

        let mut sink = handle.write_stream().unwrap();
        let mut input: &[u8] = &content;
        assert_eq!(sink.copy_from(&mut input).await.unwrap(), 100_000);
        let summary = sink.finish().await.unwrap();
        assert_eq!(summary.chunk_count, 25);

        let mut out = Vec::new();
        let copied = handle.read_stream().copy_to(&mut out).await.unwrap();
        assert_eq!(copied, 100_000);
        assert_eq!(out, content);
    }
}
