use crate::db::{self, get_f64};

/// Model pricing for cost calculation, $/MTok.
#[derive(Debug, Clone, Default)]
pub struct ModelPricing {
    pub input_price: f64,
    pub output_price: f64,
    pub cache_read_price: f64,
    pub cache_write_price: f64,
}

impl ModelPricing {
    /// Cost in microdollars for a token breakdown.
    pub fn cost_microdollars(
        &self,
        input: i64,
        output: i64,
        cache_read: i64,
        cache_write: i64,
    ) -> i64 {
        let cost = input as f64 * self.input_price
            + output as f64 * self.output_price
            + cache_read as f64 * self.cache_read_price
            + cache_write as f64 * self.cache_write_price;
        cost.round() as i64
    }
}

/// Pricing for a model, or zero pricing when the model is unknown.
pub async fn get_pricing(model_id: &str) -> ModelPricing {
    let Ok(conn) = db::get_conn().await else {
        return ModelPricing::default();
    };
    let Ok(mut rows) = conn
        .query(
            "SELECT input_price, output_price, cache_read_price, cache_write_price FROM models WHERE id = ?",
            [model_id],
        )
        .await
    else {
        return ModelPricing::default();
    };
    let Ok(Some(row)) = rows.next().await else {
        tracing::warn!("Model {model_id} not found in models table, metering cost as 0");
        return ModelPricing::default();
    };
    ModelPricing {
        input_price: get_f64(&row, 0),
        output_price: get_f64(&row, 1),
        cache_read_price: get_f64(&row, 2),
        cache_write_price: get_f64(&row, 3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_rounds_to_nearest_microdollar() {
        // $3/MTok input, $15/MTok output expressed per-token in microdollars.
        let pricing = ModelPricing {
            input_price: 3.0,
            output_price: 15.0,
            cache_read_price: 0.3,
            cache_write_price: 3.75,
        };
        // 100 input + 10 output tokens.
        assert_eq!(pricing.cost_microdollars(100, 10, 0, 0), 450);
    }

    #[tokio::test]
    async fn seeded_models_have_pricing() {
        crate::db::init_memory().await.unwrap();
        let pricing = get_pricing("claude-sonnet-4-5").await;
        assert!(pricing.input_price > 0.0);
        let unknown = get_pricing("no-such-model").await;
        assert_eq!(unknown.input_price, 0.0);
    }
}
