// Blurriness diagnostic: variance of the Laplacian of each image.
use tch::{Kind, Tensor};

const GRAYSCALE_WEIGHTS: [f32; 3] = [0.2989, 0.5870, 0.1140];
const LAPLACE_FILTER: [f32; 9] = [0., 1., 0., 1., -4., 1., 0., 1., 0.];

/// Per-image variance of the Laplacian for `[N, C, H, W]` images. Higher is sharper.
pub fn laplacian_variance(images: &Tensor) -> Tensor {
    let images = images.to_kind(Kind::Float);
    let device = images.device();
    let gray = if images.size()[1] > 1 {
        let weights = Tensor::of_slice(&GRAYSCALE_WEIGHTS)
            .view([1, 3, 1, 1])
            .to_device(device);
        (&images * weights).sum_dim_intlist(&[1], true, Kind::Float)
    } else {
        images
    };
    let filter = Tensor::of_slice(&LAPLACE_FILTER)
        .view([1, 1, 3, 3])
        .to_device(device);
    gray.conv2d(&filter, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], 1)
        .var_dim(&[1, 2, 3], false, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn flat_images_have_no_detail() {
        let images = Tensor::ones(&[2, 3, 8, 8], (Kind::Float, Device::Cpu)) * 0.5;
        let var = laplacian_variance(&images);
        assert_eq!(var.size(), [2]);
        assert!(var.abs().max().double_value(&[]) < 1e-10);
    }

    #[test]
    fn checkerboard_is_sharper_than_gradient() {
        let idx = Tensor::arange(8i64, (Kind::Float, Device::Cpu));
        let rows = idx.view([8, 1]);
        let cols = idx.view([1, 8]);
        let checker = ((&rows + &cols).remainder(2.)).view([1, 1, 8, 8]);
        let gradient = ((&rows + &cols) / 14.).view([1, 1, 8, 8]);
        let var = laplacian_variance(&Tensor::cat(&[checker, gradient], 0));
        assert!(var.double_value(&[0]) > var.double_value(&[1]));
        assert!(var.double_value(&[1]) < 1e-10);
    }
}
