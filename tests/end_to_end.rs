use futures::future::try_join3;
use lift_compaction::{
    Config, InputProcessor, ProcessedData, Role,
    channel::SimpleChannel,
    dealer::{DealerClient, SimulationError, dealer, simulate},
    input::{LocalInput, PartnerInput, PublisherInput},
};
use proptest::{collection::vec, prelude::*};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing_subscriber::EnvFilter;

const WINDOW: u32 = 10;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn publisher_input() -> PublisherInput {
    PublisherInput {
        opportunity_timestamps: vec![50, 60, 70],
        control_population: vec![true, true, false],
        test_population: vec![false, false, true],
        num_impressions: vec![0, 0, 5],
        breakdown_ids: vec![0, 1, 1],
        dummy_rows: vec![true, false, false],
    }
}

fn partner_input() -> PartnerInput {
    PartnerInput {
        cohort_group_ids: vec![1, 2, 3],
        purchase_timestamps: vec![vec![100], vec![0], vec![200]],
        purchase_values: vec![vec![30], vec![0], vec![-40]],
        purchase_values_squared: vec![vec![900], vec![0], vec![1600]],
        dummy_rows: vec![false; 3],
    }
}

fn assert_columns_have_len(data: &ProcessedData, len: usize) {
    assert_eq!(data.num_rows, len);
    for bits in [
        &data.breakdown_ids,
        &data.control_population,
        &data.is_valid_opportunity_timestamp,
        &data.test_reach,
        &data.any_valid_purchase_timestamp,
    ] {
        assert_eq!(bits.len(), len);
    }
    assert_eq!(data.opportunity_timestamps.len(), len);
    assert_eq!(data.cohort_group_ids.len(), len);
    for column in data.purchase_timestamps.iter().chain(&data.threshold_timestamps) {
        assert_eq!(column.len(), len);
    }
    assert!(data.purchase_values.iter().all(|c| c.len() == len));
    assert!(data.purchase_values_squared.iter().all(|c| c.len() == len));
}

#[tokio::test]
async fn lift_input_example() -> Result<(), SimulationError> {
    init_tracing();
    let (publisher, partner) = simulate(1, WINDOW, publisher_input(), partner_input()).await?;
    assert_columns_have_len(&publisher, 2);
    assert_columns_have_len(&partner, 2);

    let revealed = publisher.reveal(&partner);
    assert_eq!(revealed.cohort_group_ids, vec![2, 3]);
    assert_eq!(revealed.opportunity_timestamps, vec![60, 70]);
    assert_eq!(revealed.breakdown_ids, vec![true, true]);
    assert_eq!(revealed.control_population, vec![true, false]);
    assert_eq!(revealed.is_valid_opportunity_timestamp, vec![true, true]);
    assert_eq!(revealed.test_reach, vec![false, true]);
    assert_eq!(revealed.any_valid_purchase_timestamp, vec![false, true]);
    assert_eq!(revealed.purchase_timestamps, vec![vec![0, 200]]);
    assert_eq!(revealed.threshold_timestamps, vec![vec![0, 200 + WINDOW]]);
    assert_eq!(revealed.purchase_values, vec![vec![0, -40]]);
    assert_eq!(revealed.purchase_values_squared, vec![vec![0, 1600]]);
    Ok(())
}

#[tokio::test]
async fn shares_do_not_reveal_plaintext() -> Result<(), SimulationError> {
    let rows = 64;
    let publisher = PublisherInput {
        opportunity_timestamps: vec![12345; rows],
        dummy_rows: vec![false; rows],
        ..Default::default()
    };
    let partner = PartnerInput {
        cohort_group_ids: vec![7; rows],
        dummy_rows: vec![false; rows],
        ..Default::default()
    };
    let (a, b) = simulate(3, WINDOW, publisher, partner).await?;
    assert_ne!(a.cohort_group_ids.0, vec![7; rows]);
    assert_ne!(b.cohort_group_ids.0, vec![7; rows]);
    assert_eq!(a.reveal(&b).cohort_group_ids, vec![7; rows]);
    assert_eq!(a.reveal(&b).opportunity_timestamps, vec![12345; rows]);
    Ok(())
}

#[tokio::test]
async fn input_processors_with_dealer() {
    init_tracing();
    let channels = SimpleChannel::channels(3);
    let publisher_input = LocalInput::from(publisher_input());
    let partner_input = LocalInput::from(partner_input());
    let publisher_client = DealerClient::new(&channels[0], 2);
    let partner_client = DealerClient::new(&channels[1], 2);

    let publisher = InputProcessor::new(
        Config::new(Role::Publisher, 2, WINDOW).unwrap(),
        &publisher_input,
        &publisher_client,
        &publisher_client,
    )
    .unwrap();
    let partner = InputProcessor::new(
        Config::new(Role::Partner, 2, WINDOW).unwrap(),
        &partner_input,
        &partner_client,
        &partner_client,
    )
    .unwrap();
    assert_eq!((publisher.role(), partner.role()), (Role::Publisher, Role::Partner));

    let mut publisher_rng = ChaCha20Rng::seed_from_u64(1);
    let mut partner_rng = ChaCha20Rng::seed_from_u64(2);
    let (a, b, ()) = try_join3(
        async { publisher.run(&mut publisher_rng).await.map_err(|e| e.to_string()) },
        async { partner.run(&mut partner_rng).await.map_err(|e| e.to_string()) },
        async { dealer(&channels[2], 0, 1).await.map_err(|e| e.to_string()) },
    )
    .await
    .unwrap();

    let revealed = a.reveal(&b);
    assert_eq!(revealed.cohort_group_ids, vec![2, 3]);
    assert_eq!(revealed.threshold_timestamps, vec![vec![0, 210], vec![0, 0]]);
}

fn dummy_flags() -> impl Strategy<Value = (Vec<bool>, Vec<bool>)> {
    (1usize..24).prop_flat_map(|rows| (vec(any::<bool>(), rows), vec(any::<bool>(), rows)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn intersection_of_random_dummy_rows((publisher_dummies, partner_dummies) in dummy_flags()) {
        let rows = publisher_dummies.len();
        let expected: Vec<u32> = (0..rows)
            .filter(|&i| !publisher_dummies[i] && !partner_dummies[i])
            .map(|i| i as u32)
            .collect();
        let publisher = PublisherInput {
            opportunity_timestamps: vec![1; rows],
            dummy_rows: publisher_dummies,
            ..Default::default()
        };
        let partner = PartnerInput {
            cohort_group_ids: (0..rows as u32).collect(),
            dummy_rows: partner_dummies,
            ..Default::default()
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (a, b) = runtime
            .block_on(simulate(2, WINDOW, publisher, partner))
            .unwrap();
        assert_columns_have_len(&a, expected.len());
        assert_columns_have_len(&b, expected.len());
        let revealed = a.reveal(&b);
        prop_assert_eq!(revealed.cohort_group_ids, expected);
        prop_assert!(revealed.opportunity_timestamps.iter().all(|&ts| ts == 1));
    }
}
