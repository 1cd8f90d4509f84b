//! Ядро учёта ЖСК: импорт банковской выписки с привязкой платежей к
//! квартирам и расчёт месячных начислений по историчным тарифам.
//! Интерактивная оболочка живёт снаружи и работает через этот API.

pub mod apartment_extract;
pub mod charges;
pub mod registry_db;
pub mod statement_import;
pub mod tariffs;

pub use apartment_extract::{guess_apartment_number, guess_from_description, guess_from_sender_info};
pub use charges::{
    calculate_apartment_charges, generate_charges_at_db_path, month_start, round_cents,
    ChargeGenerationResult, ChargeLine,
};
pub use registry_db::{
    apply_embedded_migrations, inspect_status_at_path, load_apartments, open_db, Apartment,
    DbStatus, MigrateResult,
};
pub use statement_import::{
    apply_manual_overrides, attach_apartment_ids, parse_statement_file,
    reconcile_statement_at_db_path, save_payments_at_db_path, statement_preview_file_at_path,
    ParsedPayment, PaymentSaveRequest, PaymentSaveResult, ResolvedPayment, StatementParse,
    StatementReconcileResult,
};
pub use tariffs::{load_tariff_items, resolve_active_tariffs, TariffItem};
