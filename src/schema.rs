// Diesel table definitions. Kept in sync with `storage::sqlite::SCHEMA_SQL`.

diesel::table! {
    distributors (slug) {
        slug -> Text,
        name -> Text,
        base_url -> Text,
        active -> Integer,
        strategy -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    scrape_pacing_state (distributor_slug, date) {
        distributor_slug -> Text,
        date -> Text,
        items_scraped -> BigInt,
        daily_limit -> BigInt,
        last_offset -> BigInt,
        last_category -> Nullable<Text>,
        sessions_today -> Integer,
        last_session_at -> Nullable<Text>,
    }
}

diesel::table! {
    raw_product_records (id) {
        id -> Text,
        external_id -> Text,
        source -> Text,
        payload -> Text,
        scrape_run_id -> Nullable<Text>,
        name -> Text,
        brand -> Nullable<Text>,
        category -> Nullable<Text>,
        price_cents -> Nullable<BigInt>,
        stock_quantity -> Nullable<BigInt>,
        in_stock -> Nullable<Integer>,
        observed_at -> Text,
        processed -> Integer,
        product_id -> Nullable<Text>,
    }
}

diesel::table! {
    products (id) {
        id -> Text,
        name -> Text,
        brand -> Nullable<Text>,
        brand_key -> Nullable<Text>,
        category -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    product_aliases (source, external_id) {
        source -> Text,
        external_id -> Text,
        product_id -> Text,
        confidence -> Double,
        created_at -> Text,
    }
}

diesel::table! {
    price_history (id) {
        id -> Text,
        product_id -> Text,
        distributor_slug -> Text,
        price_cents -> BigInt,
        observed_at -> Text,
    }
}

diesel::table! {
    inventory_history (id) {
        id -> Text,
        product_id -> Text,
        distributor_slug -> Text,
        quantity -> Nullable<BigInt>,
        in_stock -> Integer,
        observed_at -> Text,
    }
}

diesel::table! {
    match_queue (id) {
        id -> Text,
        raw_record_id -> Text,
        candidate_product_id -> Text,
        confidence -> Double,
        status -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    scrape_runs (id) {
        id -> Text,
        distributor_slug -> Text,
        started_at -> Text,
        completed_at -> Nullable<Text>,
        status -> Text,
        products_found -> BigInt,
        pages_fetched -> BigInt,
        error_count -> BigInt,
        matched -> BigInt,
        created -> BigInt,
        queued -> BigInt,
        failed -> BigInt,
    }
}

diesel::table! {
    scrape_errors (id) {
        id -> Text,
        run_id -> Text,
        category -> Nullable<Text>,
        kind -> Text,
        message -> Text,
        occurred_at -> Text,
    }
}

diesel::table! {
    product_tokens (token, product_id) {
        token -> Text,
        product_id -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    distributors,
    scrape_pacing_state,
    raw_product_records,
    products,
    product_tokens,
    product_aliases,
    price_history,
    inventory_history,
    match_queue,
    scrape_runs,
    scrape_errors,
);
