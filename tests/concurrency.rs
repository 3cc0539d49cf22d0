use std::{thread, time::Duration};

use magnet::{
    AddOptions,
    IndexOptions,
    InMemoryModel,
    NeuralSearch,
    OverwritePolicy,
    SearchRequest,
};

const WRITERS: usize = 4;

fn slow_model() -> InMemoryModel {
    InMemoryModel::default().with_write_delay(Duration::from_millis(30))
}

#[test]
fn concurrent_adds_to_one_index_never_overlap() {
    let model = slow_model();
    NeuralSearch::with_model(model.clone())
        .index(
            vec!["seed document".to_string()],
            &IndexOptions::named("shared"),
        )
        .unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let model = model.clone();
            thread::spawn(move || {
                let mut search = NeuralSearch::with_model(model);
                search
                    .add_to_index(
                        vec![format!("writer {i} contribution")],
                        &AddOptions::named("shared")
                            .document_ids(vec![format!("w{i}")]),
                    )
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let spans = model.write_spans();
    assert_eq!(spans.len(), WRITERS + 1);
    for (i, a) in spans.iter().enumerate() {
        for b in &spans[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
    assert_eq!(model.passages("shared").unwrap().len(), WRITERS + 1);
}

#[test]
fn concurrent_reuse_builds_exactly_once() {
    let model = slow_model();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let model = model.clone();
            thread::spawn(move || {
                let mut search = NeuralSearch::with_model(model);
                search
                    .index(
                        vec!["the only document".to_string()],
                        &IndexOptions::named("once")
                            .overwrite(OverwritePolicy::Reuse),
                    )
                    .unwrap()
            })
        })
        .collect();
    let refs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(model.build_count("once"), 1);
    assert!(refs.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn readers_see_complete_index_while_writer_adds() {
    let model = slow_model();
    NeuralSearch::with_model(model.clone())
        .index(
            vec!["alpha beta".to_string(), "gamma delta".to_string()],
            &IndexOptions::named("live"),
        )
        .unwrap();

    let writer = {
        let model = model.clone();
        thread::spawn(move || {
            let mut search = NeuralSearch::with_model(model);
            search
                .add_to_index(
                    vec!["alpha epsilon".to_string()],
                    &AddOptions::named("live"),
                )
                .unwrap();
        })
    };

    let mut reader = NeuralSearch::with_model(model.clone());
    for _ in 0..5 {
        let results = reader
            .search(&SearchRequest::new("alpha").index("live"))
            .unwrap();
        let hits = results.single().unwrap();
        assert!(hits.len() == 1 || hits.len() == 2, "{hits:?}");
        thread::sleep(Duration::from_millis(10));
    }
    writer.join().unwrap();

    let results = reader
        .search(&SearchRequest::new("alpha").index("live"))
        .unwrap();
    assert_eq!(results.single().unwrap().len(), 2);
}
